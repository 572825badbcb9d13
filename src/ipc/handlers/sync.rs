use crate::clock::stamp;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store;
use crate::sync::{Submission, SyncCoordinator, SyncOutcome};
use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn sync_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = params.get("eventId").and_then(|v| v.as_str());
    let pending = store::pending_count(conn, event_id).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "pending": pending }))
}

/// Hands the host-owned transport the next batch of due submissions. Marks
/// nothing; the host reports verdicts back through sync.resolve.
fn sync_drain(
    conn: &Connection,
    params: &serde_json::Value,
    coordinator: &SyncCoordinator,
    now: NaiveDateTime,
) -> Result<serde_json::Value, HandlerErr> {
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(coordinator.batch_limit);
    let entries = store::list_unsynced(conn, limit, &stamp(now)).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let submissions: Vec<Submission> = entries.iter().map(Submission::from_entry).collect();
    serde_json::to_value(&submissions)
        .map(|submissions| json!({ "submissions": submissions }))
        .map_err(|e| HandlerErr {
            code: "internal",
            message: e.to_string(),
            details: None,
        })
}

fn sync_resolve(
    conn: &Connection,
    params: &serde_json::Value,
    coordinator: &SyncCoordinator,
    now: NaiveDateTime,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(results) = params.get("results").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing results".to_string(),
            details: None,
        });
    };

    let mut applied: usize = 0;
    let mut unknown: usize = 0;
    for item in results {
        let id = item
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: "result missing id".to_string(),
                details: None,
            })?;
        let outcome_raw = item
            .get("outcome")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: "result missing outcome".to_string(),
                details: None,
            })?;
        let outcome = SyncOutcome::parse(outcome_raw).ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("outcome must be acked|conflict|failed, got {}", outcome_raw),
            details: None,
        })?;
        let touched = coordinator
            .apply_verdict(conn, id, outcome, now)
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "scan_log" })),
            })?;
        if touched {
            applied += 1;
        } else {
            unknown += 1;
        }
    }

    Ok(json!({ "applied": applied, "unknown": unknown }))
}

fn handle_sync_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match sync_status(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_sync_drain(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let now = state.clock.now();
    match sync_drain(conn, &req.params, &state.coordinator, now) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_sync_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let now = state.clock.now();
    match sync_resolve(conn, &req.params, &state.coordinator, now) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sync.status" => Some(handle_sync_status(state, req)),
        "sync.drain" => Some(handle_sync_drain(state, req)),
        "sync.resolve" => Some(handle_sync_resolve(state, req)),
        _ => None,
    }
}
