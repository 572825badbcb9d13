use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use scangated::classify::{record_scan, ScanError};
use scangated::schedule::{Direction, SessionWindow};
use scangated::store::{self, EventSnapshot, RosterEntry, ScanStatus};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").expect("test moment")
}

fn window(
    id: &str,
    name: &str,
    opens: &str,
    closes: &str,
    late_after: Option<&str>,
    direction: Direction,
) -> SessionWindow {
    SessionWindow {
        id: id.to_string(),
        name: name.to_string(),
        opens: opens.to_string(),
        closes: closes.to_string(),
        late_after: late_after.map(|s| s.to_string()),
        direction,
    }
}

fn sports_day_snapshot() -> EventSnapshot {
    let mut schedule = BTreeMap::new();
    schedule.insert(
        "2026-09-14".to_string(),
        vec![
            window(
                "s-morning",
                "Morning Entry",
                "09:00",
                "10:00",
                Some("09:15"),
                Direction::In,
            ),
            window(
                "s-afternoon",
                "Afternoon Entry",
                "14:00",
                "15:00",
                None,
                Direction::In,
            ),
            window("s-exit", "Exit", "19:00", "20:00", None, Direction::Out),
        ],
    );
    EventSnapshot {
        event_id: "ev-sports".to_string(),
        name: "Sports Day".to_string(),
        schedule,
        roster: vec![
            RosterEntry {
                student_id: "stu-1".to_string(),
                scan_code: "QR-1".to_string(),
                display_name: "Adaeze O.".to_string(),
                grade_label: Some("Grade 8".to_string()),
                section_label: Some("8B".to_string()),
            },
            RosterEntry {
                student_id: "stu-2".to_string(),
                scan_code: "QR-2".to_string(),
                display_name: "Mateo R.".to_string(),
                grade_label: Some("Grade 8".to_string()),
                section_label: Some("8A".to_string()),
            },
        ],
        downloaded_at: None,
    }
}

fn open_with_snapshot(prefix: &str) -> (PathBuf, rusqlite::Connection) {
    let workspace = temp_dir(prefix);
    let conn = store::open_db(&workspace).expect("open db");
    store::save_event_snapshot(&conn, &sports_day_snapshot(), "2026-09-13T18:00:00")
        .expect("save snapshot");
    (workspace, conn)
}

#[test]
fn scenario_on_time_late_then_duplicate() {
    let (workspace, conn) = open_with_snapshot("scangate-scenario-a");

    let first = record_scan(&conn, "ev-sports", "QR-1", at("2026-09-14T09:10:00")).expect("scan");
    assert_eq!(first.status, ScanStatus::Present);
    assert_eq!(first.session_id.as_deref(), Some("s-morning"));
    assert_eq!(first.student_id.as_deref(), Some("stu-1"));
    assert!(first.reason.is_none());

    let late = record_scan(&conn, "ev-sports", "QR-2", at("2026-09-14T09:20:00")).expect("scan");
    assert_eq!(late.status, ScanStatus::Late);
    assert!(late.reason.is_none());

    let again = record_scan(&conn, "ev-sports", "QR-1", at("2026-09-14T09:25:00")).expect("scan");
    assert_eq!(again.status, ScanStatus::Duplicate);
    assert_eq!(
        again.reason.as_deref(),
        Some("already scanned for Morning Entry")
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scenario_unscheduled_day_denies() {
    let (workspace, conn) = open_with_snapshot("scangate-scenario-b");

    let entry = record_scan(&conn, "ev-sports", "QR-1", at("2026-09-15T09:10:00")).expect("scan");
    assert_eq!(entry.status, ScanStatus::Denied);
    assert_eq!(
        entry.reason.as_deref(),
        Some("no scanning scheduled for today")
    );
    assert!(entry.session_id.is_none());

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scenario_before_opening_names_friendly_start() {
    let (workspace, conn) = open_with_snapshot("scangate-scenario-c");

    let entry = record_scan(&conn, "ev-sports", "QR-1", at("2026-09-14T13:30:00")).expect("scan");
    assert_eq!(entry.status, ScanStatus::Denied);
    assert_eq!(
        entry.reason.as_deref(),
        Some("Afternoon Entry starts at 2 PM")
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scenario_unknown_code_denied_and_logged() {
    let (workspace, conn) = open_with_snapshot("scangate-scenario-d");

    let entry =
        record_scan(&conn, "ev-sports", "QR-NOBODY", at("2026-09-14T09:10:00")).expect("scan");
    assert_eq!(entry.status, ScanStatus::Denied);
    assert_eq!(entry.reason.as_deref(), Some("not recognized for this event"));
    assert!(entry.student_id.is_none());
    // Session did resolve; the denial keeps it for the audit trail.
    assert_eq!(entry.session_id.as_deref(), Some("s-morning"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn exit_window_is_never_late() {
    let (workspace, conn) = open_with_snapshot("scangate-exit");

    let entry = record_scan(&conn, "ev-sports", "QR-1", at("2026-09-14T19:55:00")).expect("scan");
    assert_eq!(entry.status, ScanStatus::Present);
    assert_eq!(entry.session_id.as_deref(), Some("s-exit"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn missing_snapshot_is_a_precondition_not_a_classification() {
    let workspace = temp_dir("scangate-not-downloaded");
    let conn = store::open_db(&workspace).expect("open db");

    let err = record_scan(&conn, "ev-unknown", "QR-1", at("2026-09-14T09:10:00"))
        .expect_err("must fail");
    match err {
        ScanError::NotDownloaded { event_id } => assert_eq!(event_id, "ev-unknown"),
        other => panic!("expected NotDownloaded, got {}", other),
    }
    // Nothing queued.
    assert_eq!(store::pending_count(&conn, None).expect("count"), 0);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn at_most_one_check_in_per_triple() {
    let (workspace, conn) = open_with_snapshot("scangate-uniqueness");

    // Mixed sequence: denials, repeats, both students, both sessions.
    for (code, moment) in [
        ("QR-1", "2026-09-14T09:05:00"),
        ("QR-NOBODY", "2026-09-14T09:06:00"),
        ("QR-1", "2026-09-14T09:07:00"),
        ("QR-2", "2026-09-14T09:30:00"),
        ("QR-2", "2026-09-14T09:31:00"),
        ("QR-1", "2026-09-14T14:05:00"),
        ("QR-1", "2026-09-14T14:06:00"),
        ("QR-2", "2026-09-15T09:00:00"),
    ] {
        let _ = record_scan(&conn, "ev-sports", code, at(moment)).expect("scan");
    }

    let entries = store::list_scan_log(&conn, "ev-sports").expect("list");
    assert_eq!(entries.len(), 8);

    // Only present/late consume the check-in. A duplicate entry records that
    // the check-in was already used; it never creates a second one.
    let mut checked_in: HashMap<(String, String), usize> = HashMap::new();
    for e in &entries {
        if !matches!(e.status, ScanStatus::Present | ScanStatus::Late) {
            continue;
        }
        let key = (
            e.session_id.clone().expect("check-in has session"),
            e.student_id.clone().expect("check-in has student"),
        );
        *checked_in.entry(key).or_default() += 1;
    }
    for ((session, student), count) in checked_in {
        assert!(
            count <= 1,
            "{} check-ins for session {} student {}",
            count,
            session,
            student
        );
    }

    // Every duplicate points at a triple that already holds its check-in.
    for e in &entries {
        if e.status != ScanStatus::Duplicate {
            continue;
        }
        let key = (
            e.session_id.clone().expect("duplicate has session"),
            e.student_id.clone().expect("duplicate has student"),
        );
        assert!(
            entries.iter().any(|other| {
                matches!(other.status, ScanStatus::Present | ScanStatus::Late)
                    && other.session_id.as_deref() == Some(key.0.as_str())
                    && other.student_id.as_deref() == Some(key.1.as_str())
            }),
            "duplicate for session {} student {} without a check-in",
            key.0,
            key.1
        );
    }

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn log_and_queue_survive_reopen() {
    let (workspace, conn) = open_with_snapshot("scangate-restart");

    let _ = record_scan(&conn, "ev-sports", "QR-1", at("2026-09-14T09:10:00")).expect("scan");
    let _ = record_scan(&conn, "ev-sports", "QR-2", at("2026-09-14T09:20:00")).expect("scan");
    drop(conn);

    let conn = store::open_db(&workspace).expect("reopen db");
    let entries = store::list_scan_log(&conn, "ev-sports").expect("list");
    assert_eq!(entries.len(), 2);
    assert_eq!(store::pending_count(&conn, None).expect("count"), 2);

    let snapshot = store::get_event_snapshot(&conn, "ev-sports")
        .expect("read snapshot")
        .expect("snapshot present");
    assert_eq!(snapshot.roster.len(), 2);
    assert_eq!(snapshot.downloaded_at.as_deref(), Some("2026-09-13T18:00:00"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn redownload_replaces_schedule_and_roster() {
    let (workspace, conn) = open_with_snapshot("scangate-redownload");

    let mut refreshed = sports_day_snapshot();
    refreshed.roster.pop();
    refreshed
        .schedule
        .get_mut("2026-09-14")
        .expect("day")
        .truncate(1);
    store::save_event_snapshot(&conn, &refreshed, "2026-09-14T07:00:00").expect("refresh");

    let snapshot = store::get_event_snapshot(&conn, "ev-sports")
        .expect("read")
        .expect("present");
    assert_eq!(snapshot.roster.len(), 1);
    assert_eq!(snapshot.schedule["2026-09-14"].len(), 1);
    assert_eq!(snapshot.downloaded_at.as_deref(), Some("2026-09-14T07:00:00"));

    let _ = std::fs::remove_dir_all(workspace);
}
