use crate::schedule::{Direction, EventSchedule, SessionWindow};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Classification result for one physical scan attempt. Written once by the
/// classifier; never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Present,
    Late,
    Denied,
    Duplicate,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Present => "present",
            ScanStatus::Late => "late",
            ScanStatus::Denied => "denied",
            ScanStatus::Duplicate => "duplicate",
        }
    }

    pub fn parse(s: &str) -> Option<ScanStatus> {
        match s {
            "present" => Some(ScanStatus::Present),
            "late" => Some(ScanStatus::Late),
            "denied" => Some(ScanStatus::Denied),
            "duplicate" => Some(ScanStatus::Duplicate),
            _ => None,
        }
    }
}

/// Delivery status of a locally recorded scan with respect to the remote
/// authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<SyncState> {
        match s {
            "pending" => Some(SyncState::Pending),
            "synced" => Some(SyncState::Synced),
            "failed" => Some(SyncState::Failed),
            _ => None,
        }
    }
}

/// One student authorized to scan at an event, keyed by the code embedded in
/// their QR badge. `scan_code` is unique within an event's roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub student_id: String,
    pub scan_code: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_label: Option<String>,
}

/// The downloaded schedule + roster for one event. `downloaded_at` is
/// display-only ("synced N minutes ago"); correctness never depends on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSnapshot {
    pub event_id: String,
    pub name: String,
    pub schedule: EventSchedule,
    pub roster: Vec<RosterEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<String>,
}

/// The unit of truth for one scan attempt. `status`/`reason` are immutable
/// once appended; only the delivery fields (`sync_state`, `attempts`) change
/// afterwards. `student_id` is absent when the scan code was not in the
/// roster — a denied attempt by an unknown code has no student to name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanLogEntry {
    pub id: String,
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    pub scan_code: String,
    pub scanned_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_direction: Option<Direction>,
    pub status: ScanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub sync_state: SyncState,
    pub attempts: i64,
    pub created_at: String,
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("scangate.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // The sync loop may run on its own connection to the same file.
    conn.busy_timeout(Duration::from_millis(5000))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            downloaded_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS event_sessions(
            event_id TEXT NOT NULL,
            date_key TEXT NOT NULL,
            position INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            opens TEXT NOT NULL,
            closes TEXT NOT NULL,
            late_after TEXT,
            direction TEXT NOT NULL,
            PRIMARY KEY(event_id, session_id),
            FOREIGN KEY(event_id) REFERENCES events(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_event_sessions_date
         ON event_sessions(event_id, date_key, position)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS roster_entries(
            event_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            scan_code TEXT NOT NULL,
            display_name TEXT NOT NULL,
            grade_label TEXT,
            section_label TEXT,
            PRIMARY KEY(event_id, student_id),
            UNIQUE(event_id, scan_code),
            FOREIGN KEY(event_id) REFERENCES events(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_roster_entries_code
         ON roster_entries(event_id, scan_code)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scan_log(
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            student_id TEXT,
            scan_code TEXT NOT NULL,
            scanned_at TEXT NOT NULL,
            session_id TEXT,
            session_name TEXT,
            session_direction TEXT,
            status TEXT NOT NULL,
            reason TEXT,
            sync_state TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    // Hot path: one lookup per physical scan.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scan_log_triple
         ON scan_log(event_id, session_id, student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scan_log_queue
         ON scan_log(sync_state, created_at)",
        [],
    )?;

    // Devices that predate durable retry bookkeeping lack these columns.
    ensure_scan_log_retry_columns(&conn)?;

    Ok(conn)
}

fn ensure_scan_log_retry_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "scan_log", "attempts")? {
        conn.execute(
            "ALTER TABLE scan_log ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "scan_log", "next_attempt_at")? {
        conn.execute("ALTER TABLE scan_log ADD COLUMN next_attempt_at TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Upserts one event's schedule + roster in a single transaction, stamping
/// the download moment. Re-downloading an event replaces both wholesale.
pub fn save_event_snapshot(
    conn: &Connection,
    snapshot: &EventSnapshot,
    downloaded_at: &str,
) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO events(id, name, downloaded_at)
         VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           downloaded_at = excluded.downloaded_at",
        (&snapshot.event_id, &snapshot.name, downloaded_at),
    )?;
    tx.execute(
        "DELETE FROM event_sessions WHERE event_id = ?",
        [&snapshot.event_id],
    )?;
    tx.execute(
        "DELETE FROM roster_entries WHERE event_id = ?",
        [&snapshot.event_id],
    )?;

    for (date_key, sessions) in &snapshot.schedule {
        for (position, s) in sessions.iter().enumerate() {
            tx.execute(
                "INSERT INTO event_sessions(
                    event_id, date_key, position, session_id,
                    name, opens, closes, late_after, direction
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &snapshot.event_id,
                    date_key,
                    position as i64,
                    &s.id,
                    &s.name,
                    &s.opens,
                    &s.closes,
                    &s.late_after,
                    s.direction.as_str(),
                ),
            )?;
        }
    }

    for r in &snapshot.roster {
        tx.execute(
            "INSERT INTO roster_entries(
                event_id, student_id, scan_code,
                display_name, grade_label, section_label
             ) VALUES(?, ?, ?, ?, ?, ?)",
            (
                &snapshot.event_id,
                &r.student_id,
                &r.scan_code,
                &r.display_name,
                &r.grade_label,
                &r.section_label,
            ),
        )?;
    }

    tx.commit()?;
    Ok(())
}

pub fn get_event_snapshot(
    conn: &Connection,
    event_id: &str,
) -> anyhow::Result<Option<EventSnapshot>> {
    let header: Option<(String, String)> = conn
        .query_row(
            "SELECT name, downloaded_at FROM events WHERE id = ?",
            [event_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((name, downloaded_at)) = header else {
        return Ok(None);
    };

    let mut schedule = EventSchedule::new();
    let mut stmt = conn.prepare(
        "SELECT date_key, session_id, name, opens, closes, late_after, direction
         FROM event_sessions
         WHERE event_id = ?
         ORDER BY date_key, position",
    )?;
    let sessions = stmt
        .query_map([event_id], |r| {
            let date_key: String = r.get(0)?;
            let direction_raw: String = r.get(6)?;
            Ok((
                date_key,
                SessionWindow {
                    id: r.get(1)?,
                    name: r.get(2)?,
                    opens: r.get(3)?,
                    closes: r.get(4)?,
                    late_after: r.get(5)?,
                    direction: parse_direction_col(&direction_raw)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (date_key, window) in sessions {
        schedule.entry(date_key).or_default().push(window);
    }

    let mut stmt = conn.prepare(
        "SELECT student_id, scan_code, display_name, grade_label, section_label
         FROM roster_entries
         WHERE event_id = ?
         ORDER BY display_name, student_id",
    )?;
    let roster = stmt
        .query_map([event_id], |r| {
            Ok(RosterEntry {
                student_id: r.get(0)?,
                scan_code: r.get(1)?,
                display_name: r.get(2)?,
                grade_label: r.get(3)?,
                section_label: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(EventSnapshot {
        event_id: event_id.to_string(),
        name,
        schedule,
        roster,
        downloaded_at: Some(downloaded_at),
    }))
}

pub fn find_roster_entry(
    conn: &Connection,
    event_id: &str,
    scan_code: &str,
) -> anyhow::Result<Option<RosterEntry>> {
    let entry = conn
        .query_row(
            "SELECT student_id, scan_code, display_name, grade_label, section_label
             FROM roster_entries
             WHERE event_id = ? AND scan_code = ?",
            (event_id, scan_code),
            |r| {
                Ok(RosterEntry {
                    student_id: r.get(0)?,
                    scan_code: r.get(1)?,
                    display_name: r.get(2)?,
                    grade_label: r.get(3)?,
                    section_label: r.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(entry)
}

const SCAN_LOG_COLUMNS: &str = "id, event_id, student_id, scan_code, scanned_at,
     session_id, session_name, session_direction,
     status, reason, sync_state, attempts, created_at";

fn scan_log_from_row(r: &Row<'_>) -> rusqlite::Result<ScanLogEntry> {
    let direction_raw: Option<String> = r.get(7)?;
    let status_raw: String = r.get(8)?;
    let sync_raw: String = r.get(10)?;
    Ok(ScanLogEntry {
        id: r.get(0)?,
        event_id: r.get(1)?,
        student_id: r.get(2)?,
        scan_code: r.get(3)?,
        scanned_at: r.get(4)?,
        session_id: r.get(5)?,
        session_name: r.get(6)?,
        session_direction: match direction_raw {
            Some(raw) => Some(parse_direction_col(&raw)?),
            None => None,
        },
        status: ScanStatus::parse(&status_raw)
            .ok_or_else(|| bad_text_column(8, format!("unknown scan status: {}", status_raw)))?,
        reason: r.get(9)?,
        sync_state: SyncState::parse(&sync_raw)
            .ok_or_else(|| bad_text_column(10, format!("unknown sync state: {}", sync_raw)))?,
        attempts: r.get(11)?,
        created_at: r.get(12)?,
    })
}

fn parse_direction_col(raw: &str) -> rusqlite::Result<Direction> {
    Direction::parse(raw)
        .ok_or_else(|| bad_text_column(0, format!("unknown session direction: {}", raw)))
}

fn bad_text_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

/// Insert-only. Logical outcomes (denied, duplicate) are decided upstream;
/// this fails only on storage-medium errors, and the operator re-scans.
pub fn append_scan_log(conn: &Connection, entry: &ScanLogEntry) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO scan_log(
            id, event_id, student_id, scan_code, scanned_at,
            session_id, session_name, session_direction,
            status, reason, sync_state, attempts, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            entry.id,
            entry.event_id,
            entry.student_id,
            entry.scan_code,
            entry.scanned_at,
            entry.session_id,
            entry.session_name,
            entry.session_direction.map(|d| d.as_str()),
            entry.status.as_str(),
            entry.reason,
            entry.sync_state.as_str(),
            entry.attempts,
            entry.created_at,
        ],
    )?;
    Ok(())
}

/// Duplicate check: the one non-denied entry for this (event, session,
/// student) triple, if it exists. Denied attempts never use up a check-in.
pub fn find_log_entry(
    conn: &Connection,
    event_id: &str,
    session_id: &str,
    student_id: &str,
) -> anyhow::Result<Option<ScanLogEntry>> {
    let sql = format!(
        "SELECT {} FROM scan_log
         WHERE event_id = ? AND session_id = ? AND student_id = ?
           AND status <> 'denied'
         ORDER BY created_at, rowid
         LIMIT 1",
        SCAN_LOG_COLUMNS
    );
    let entry = conn
        .query_row(&sql, (event_id, session_id, student_id), scan_log_from_row)
        .optional()?;
    Ok(entry)
}

pub fn get_log_entry(conn: &Connection, id: &str) -> anyhow::Result<Option<ScanLogEntry>> {
    let sql = format!("SELECT {} FROM scan_log WHERE id = ?", SCAN_LOG_COLUMNS);
    let entry = conn.query_row(&sql, [id], scan_log_from_row).optional()?;
    Ok(entry)
}

/// Pending/failed entries due for (re)submission at `now`, in creation
/// order. Failed entries re-enter automatically once their backoff expires.
pub fn list_unsynced(
    conn: &Connection,
    limit: usize,
    now: &str,
) -> anyhow::Result<Vec<ScanLogEntry>> {
    let sql = format!(
        "SELECT {} FROM scan_log
         WHERE sync_state IN ('pending', 'failed')
           AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
         ORDER BY created_at, rowid
         LIMIT ?",
        SCAN_LOG_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map((now, limit as i64), scan_log_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn mark_synced(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let n = conn.execute(
        "UPDATE scan_log SET sync_state = 'synced', next_attempt_at = NULL WHERE id = ?",
        [id],
    )?;
    Ok(n > 0)
}

pub fn mark_failed(conn: &Connection, id: &str, next_attempt_at: &str) -> anyhow::Result<bool> {
    let n = conn.execute(
        "UPDATE scan_log
         SET sync_state = 'failed', attempts = attempts + 1, next_attempt_at = ?
         WHERE id = ?",
        (next_attempt_at, id),
    )?;
    Ok(n > 0)
}

/// Count behind the operator-facing "N pending sync" indicator.
pub fn pending_count(conn: &Connection, event_id: Option<&str>) -> anyhow::Result<i64> {
    let count = match event_id {
        Some(eid) => conn.query_row(
            "SELECT COUNT(*) FROM scan_log WHERE sync_state <> 'synced' AND event_id = ?",
            [eid],
            |r| r.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM scan_log WHERE sync_state <> 'synced'",
            [],
            |r| r.get(0),
        )?,
    };
    Ok(count)
}

pub fn list_scan_log(conn: &Connection, event_id: &str) -> anyhow::Result<Vec<ScanLogEntry>> {
    let sql = format!(
        "SELECT {} FROM scan_log
         WHERE event_id = ?
         ORDER BY created_at, rowid",
        SCAN_LOG_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([event_id], scan_log_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}
