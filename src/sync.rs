use crate::clock::{stamp, Clock};
use crate::store::{self, ScanLogEntry, ScanStatus};
use chrono::{Duration, NaiveDateTime};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// What one queued entry looks like on the wire. The client-generated `id`
/// is the idempotency key: resubmitting after a timeout cannot double count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: ScanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub scanned_at: String,
}

impl Submission {
    pub fn from_entry(entry: &ScanLogEntry) -> Submission {
        Submission {
            id: entry.id.clone(),
            event_id: entry.event_id.clone(),
            student_id: entry.student_id.clone(),
            session_id: entry.session_id.clone(),
            status: entry.status,
            reason: entry.reason.clone(),
            scanned_at: entry.scanned_at.clone(),
        }
    }
}

/// Definitive verdicts from the remote authority. `Conflict` means another
/// device already holds the non-denied entry for this (event, session,
/// student) triple; the remote's record wins for reporting, and the local
/// entry is considered delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitAck {
    Accepted,
    /// The remote already has this exact id (a redelivery).
    AlreadyRecorded,
    Conflict,
}

/// Non-definitive failures: timeouts and 5xx-class errors. The transport
/// impl owns the per-attempt timeout; the coordinator only ever sees the
/// attempt as a whole having failed.
#[derive(Debug)]
pub enum SubmitError {
    Transient(String),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Transient(msg) => write!(f, "transient submit failure: {}", msg),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Transport seam to the authoritative remote store. Network mechanics live
/// behind this; tests script it.
pub trait RemoteAuthority {
    fn submit(&mut self, submission: &Submission) -> Result<SubmitAck, SubmitError>;
}

/// Exponential backoff for transient submit failures: base * 2^attempts,
/// capped. Keeps a flaky link from being hammered in a tight loop.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base_secs: i64,
    pub cap_secs: i64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base_secs: 5,
            cap_secs: 300,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempts: i64) -> Duration {
        let exponent = attempts.clamp(0, 16) as u32;
        let secs = self
            .base_secs
            .saturating_mul(1_i64 << exponent)
            .min(self.cap_secs);
        Duration::seconds(secs)
    }
}

/// What one drain pass did. `remaining` counts everything still pending or
/// failed afterwards, including entries parked behind their backoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub submitted: usize,
    pub synced: usize,
    pub failed: usize,
    pub remaining: i64,
}

/// A host-reported verdict for one drained entry, used when the transport
/// runs outside this process and reports back over IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Acked,
    Conflict,
    Failed,
}

impl SyncOutcome {
    pub fn parse(s: &str) -> Option<SyncOutcome> {
        match s {
            "acked" => Some(SyncOutcome::Acked),
            "conflict" => Some(SyncOutcome::Conflict),
            "failed" => Some(SyncOutcome::Failed),
            _ => None,
        }
    }
}

pub struct SyncCoordinator {
    pub batch_limit: usize,
    pub backoff: Backoff,
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        SyncCoordinator {
            batch_limit: 25,
            backoff: Backoff::default(),
        }
    }
}

impl SyncCoordinator {
    /// Drains one batch of due entries in creation order. Definitive
    /// verdicts (accepted, already recorded, conflict) mark the entry
    /// synced — local `status`/`reason` stay untouched either way, so the
    /// device's own classification survives as the audit record. Transient
    /// failures park the entry behind its backoff; nothing is ever
    /// discarded.
    pub fn run_once(
        &self,
        conn: &Connection,
        remote: &mut dyn RemoteAuthority,
        now: NaiveDateTime,
    ) -> anyhow::Result<SyncReport> {
        let batch = store::list_unsynced(conn, self.batch_limit, &stamp(now))?;
        let mut report = SyncReport::default();

        for entry in &batch {
            report.submitted += 1;
            match remote.submit(&Submission::from_entry(entry)) {
                Ok(SubmitAck::Accepted | SubmitAck::AlreadyRecorded | SubmitAck::Conflict) => {
                    store::mark_synced(conn, &entry.id)?;
                    report.synced += 1;
                }
                Err(SubmitError::Transient(_)) => {
                    let due = now + self.backoff.delay(entry.attempts);
                    store::mark_failed(conn, &entry.id, &stamp(due))?;
                    report.failed += 1;
                }
            }
        }

        report.remaining = store::pending_count(conn, None)?;
        Ok(report)
    }

    /// Reconnect-style catch-up: keeps draining until the queue is empty or
    /// `max_rounds` passes have run. Each round re-reads the clock, so a
    /// moving clock naturally walks past backoff windows.
    pub fn run_until_drained(
        &self,
        conn: &Connection,
        remote: &mut dyn RemoteAuthority,
        clock: &dyn Clock,
        max_rounds: usize,
    ) -> anyhow::Result<SyncReport> {
        let mut total = SyncReport::default();
        for _ in 0..max_rounds {
            let round = self.run_once(conn, remote, clock.now())?;
            total.submitted += round.submitted;
            total.synced += round.synced;
            total.failed += round.failed;
            total.remaining = round.remaining;
            if round.remaining == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Applies a host-reported verdict to one entry. Same reconciliation
    /// rules as `run_once`; returns false if the id is unknown.
    pub fn apply_verdict(
        &self,
        conn: &Connection,
        id: &str,
        outcome: SyncOutcome,
        now: NaiveDateTime,
    ) -> anyhow::Result<bool> {
        match outcome {
            SyncOutcome::Acked | SyncOutcome::Conflict => store::mark_synced(conn, id),
            SyncOutcome::Failed => {
                let Some(entry) = store::get_log_entry(conn, id)? else {
                    return Ok(false);
                };
                let due = now + self.backoff.delay(entry.attempts);
                store::mark_failed(conn, id, &stamp(due))
            }
        }
    }
}
