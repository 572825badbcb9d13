use crate::clock::stamp;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, EventSnapshot};
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

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn snapshot_save(
    conn: &Connection,
    params: &serde_json::Value,
    downloaded_at: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(event_val) = params.get("event") else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing event".to_string(),
            details: None,
        });
    };
    let snapshot: EventSnapshot =
        serde_json::from_value(event_val.clone()).map_err(|e| HandlerErr {
            code: "bad_params",
            message: format!("malformed event payload: {}", e),
            details: None,
        })?;

    store::save_event_snapshot(conn, &snapshot, downloaded_at).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "events" })),
    })?;

    let session_count: usize = snapshot.schedule.values().map(|v| v.len()).sum();
    Ok(json!({
        "eventId": snapshot.event_id,
        "sessions": session_count,
        "rosterSize": snapshot.roster.len(),
        "downloadedAt": downloaded_at
    }))
}

fn snapshot_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    let snapshot = store::get_event_snapshot(conn, &event_id).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let Some(snapshot) = snapshot else {
        return Err(HandlerErr {
            code: "not_found",
            message: "event not downloaded".to_string(),
            details: None,
        });
    };
    serde_json::to_value(&snapshot)
        .map(|event| json!({ "event": event }))
        .map_err(|e| HandlerErr {
            code: "internal",
            message: e.to_string(),
            details: None,
        })
}

fn handle_snapshot_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let downloaded_at = stamp(state.clock.now());
    match snapshot_save(conn, &req.params, &downloaded_at) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_snapshot_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match snapshot_get(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "snapshot.save" => Some(handle_snapshot_save(state, req)),
        "snapshot.get" => Some(handle_snapshot_get(state, req)),
        _ => None,
    }
}
