use crate::clock::stamp;
use crate::schedule::{self, Resolution};
use crate::store::{self, RosterEntry, ScanLogEntry, ScanStatus, SyncState};
use chrono::NaiveDateTime;
use rusqlite::Connection;
use uuid::Uuid;

/// Failures surrounding a scan attempt. Classification itself cannot fail;
/// these are the precondition and storage cases around it.
#[derive(Debug)]
pub enum ScanError {
    /// The event's snapshot was never downloaded to this device. Surfaced
    /// before any classification is attempted; nothing is queued.
    NotDownloaded { event_id: String },
    /// Local write failure. The operator re-scans; nothing is queued.
    Storage(anyhow::Error),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::NotDownloaded { event_id } => {
                write!(f, "event {} has not been downloaded to this device", event_id)
            }
            ScanError::Storage(e) => write!(f, "scan log write failed: {}", e),
        }
    }
}

impl std::error::Error for ScanError {}

/// The classification verdict, before it is stamped into a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub status: ScanStatus,
    pub reason: Option<String>,
}

/// Pure decision core. Short-circuits on the first applicable denial:
/// no open session, then unrecognized code, then duplicate; otherwise
/// late/present. Accepted outcomes carry no stored reason — the display
/// layer renders a canned message per status.
pub fn classify(
    resolution: &Resolution,
    roster_hit: Option<&RosterEntry>,
    prior_entry: Option<&ScanLogEntry>,
    now: NaiveDateTime,
) -> Decision {
    let Some(session) = resolution.session.as_ref() else {
        return Decision {
            status: ScanStatus::Denied,
            reason: Some(
                resolution
                    .denial_reason
                    .clone()
                    .unwrap_or_else(|| "no scanning scheduled for today".to_string()),
            ),
        };
    };

    if roster_hit.is_none() {
        return Decision {
            status: ScanStatus::Denied,
            reason: Some("not recognized for this event".to_string()),
        };
    }

    if prior_entry.is_some() {
        return Decision {
            status: ScanStatus::Duplicate,
            reason: Some(format!("already scanned for {}", session.name)),
        };
    }

    let status = if schedule::is_late(session, now) {
        ScanStatus::Late
    } else {
        ScanStatus::Present
    };
    Decision {
        status,
        reason: None,
    }
}

/// Classifies one scan and appends the resulting entry with
/// `sync_state = pending`. Appending is the only mutation performed here;
/// prior entries are never rewritten, so the log stays a complete record of
/// every attempt, denials and duplicates included.
pub fn record_scan(
    conn: &Connection,
    event_id: &str,
    scan_code: &str,
    now: NaiveDateTime,
) -> Result<ScanLogEntry, ScanError> {
    let snapshot = store::get_event_snapshot(conn, event_id)
        .map_err(ScanError::Storage)?
        .ok_or_else(|| ScanError::NotDownloaded {
            event_id: event_id.to_string(),
        })?;

    let resolution = schedule::resolve(&snapshot.schedule, now);
    let roster_hit =
        store::find_roster_entry(conn, event_id, scan_code).map_err(ScanError::Storage)?;

    let prior_entry = match (resolution.session.as_ref(), roster_hit.as_ref()) {
        (Some(session), Some(hit)) => {
            store::find_log_entry(conn, event_id, &session.id, &hit.student_id)
                .map_err(ScanError::Storage)?
        }
        _ => None,
    };

    let decision = classify(&resolution, roster_hit.as_ref(), prior_entry.as_ref(), now);

    let moment = stamp(now);
    let entry = ScanLogEntry {
        id: Uuid::new_v4().to_string(),
        event_id: event_id.to_string(),
        student_id: roster_hit.map(|hit| hit.student_id),
        scan_code: scan_code.to_string(),
        scanned_at: moment.clone(),
        session_id: resolution.session.as_ref().map(|s| s.id.clone()),
        session_name: resolution.session.as_ref().map(|s| s.name.clone()),
        session_direction: resolution.session.as_ref().map(|s| s.direction),
        status: decision.status,
        reason: decision.reason,
        sync_state: SyncState::Pending,
        attempts: 0,
        created_at: moment,
    };

    store::append_scan_log(conn, &entry).map_err(ScanError::Storage)?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Direction, SessionWindow};

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").expect("test moment")
    }

    fn open_resolution() -> Resolution {
        Resolution {
            session: Some(SessionWindow {
                id: "s1".to_string(),
                name: "Morning Entry".to_string(),
                opens: "09:00".to_string(),
                closes: "10:00".to_string(),
                late_after: Some("09:15".to_string()),
                direction: Direction::In,
            }),
            date_key: "2026-09-14".to_string(),
            denial_reason: None,
        }
    }

    fn roster_hit() -> RosterEntry {
        RosterEntry {
            student_id: "stu-1".to_string(),
            scan_code: "QR-1".to_string(),
            display_name: "Adaeze O.".to_string(),
            grade_label: None,
            section_label: None,
        }
    }

    fn prior(status: ScanStatus) -> ScanLogEntry {
        ScanLogEntry {
            id: "prior".to_string(),
            event_id: "ev-1".to_string(),
            student_id: Some("stu-1".to_string()),
            scan_code: "QR-1".to_string(),
            scanned_at: "2026-09-14T09:05:00".to_string(),
            session_id: Some("s1".to_string()),
            session_name: Some("Morning Entry".to_string()),
            session_direction: Some(Direction::In),
            status,
            reason: None,
            sync_state: SyncState::Pending,
            attempts: 0,
            created_at: "2026-09-14T09:05:00".to_string(),
        }
    }

    #[test]
    fn resolver_denial_wins_over_everything() {
        let resolution = Resolution {
            session: None,
            date_key: "2026-09-14".to_string(),
            denial_reason: Some("no scanning scheduled for today".to_string()),
        };
        let hit = roster_hit();
        let d = classify(&resolution, Some(&hit), None, at("2026-09-14T09:10:00"));
        assert_eq!(d.status, ScanStatus::Denied);
        assert_eq!(d.reason.as_deref(), Some("no scanning scheduled for today"));
    }

    #[test]
    fn unrecognized_code_denied_inside_open_session() {
        let d = classify(&open_resolution(), None, None, at("2026-09-14T09:10:00"));
        assert_eq!(d.status, ScanStatus::Denied);
        assert_eq!(d.reason.as_deref(), Some("not recognized for this event"));
    }

    #[test]
    fn duplicate_names_the_session() {
        let hit = roster_hit();
        let earlier = prior(ScanStatus::Present);
        let d = classify(
            &open_resolution(),
            Some(&hit),
            Some(&earlier),
            at("2026-09-14T09:25:00"),
        );
        assert_eq!(d.status, ScanStatus::Duplicate);
        assert_eq!(d.reason.as_deref(), Some("already scanned for Morning Entry"));
    }

    #[test]
    fn on_time_and_late_store_no_reason() {
        let hit = roster_hit();
        let on_time = classify(&open_resolution(), Some(&hit), None, at("2026-09-14T09:10:00"));
        assert_eq!(on_time.status, ScanStatus::Present);
        assert!(on_time.reason.is_none());

        let late = classify(&open_resolution(), Some(&hit), None, at("2026-09-14T09:20:00"));
        assert_eq!(late.status, ScanStatus::Late);
        assert!(late.reason.is_none());
    }
}
