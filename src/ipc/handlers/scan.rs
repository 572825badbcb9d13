use crate::classify::{self, ScanError};
use crate::clock::parse_stamp;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store;
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

/// The decoder may supply the decode moment; otherwise the device clock at
/// request time stands in.
fn scan_moment(
    params: &serde_json::Value,
    fallback: NaiveDateTime,
) -> Result<NaiveDateTime, HandlerErr> {
    let Some(raw) = params.get("scannedAt") else {
        return Ok(fallback);
    };
    if raw.is_null() {
        return Ok(fallback);
    }
    let Some(s) = raw.as_str() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "scannedAt must be a string or null".to_string(),
            details: None,
        });
    };
    parse_stamp(s).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "scannedAt must look like YYYY-MM-DDTHH:MM:SS".to_string(),
        details: None,
    })
}

fn scan_record(
    conn: &Connection,
    params: &serde_json::Value,
    fallback_now: NaiveDateTime,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    let scan_code = get_required_str(params, "scanCode")?;
    let now = scan_moment(params, fallback_now)?;

    match classify::record_scan(conn, &event_id, &scan_code, now) {
        Ok(entry) => serde_json::to_value(&entry)
            .map(|entry| json!({ "entry": entry }))
            .map_err(|e| HandlerErr {
                code: "internal",
                message: e.to_string(),
                details: None,
            }),
        Err(ScanError::NotDownloaded { event_id }) => Err(HandlerErr {
            code: "not_downloaded",
            message: format!("event {} has not been downloaded to this device", event_id),
            details: None,
        }),
        Err(ScanError::Storage(e)) => Err(HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "scan_log" })),
        }),
    }
}

fn scanlog_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    let entries = store::list_scan_log(conn, &event_id).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    serde_json::to_value(&entries)
        .map(|entries| json!({ "entries": entries }))
        .map_err(|e| HandlerErr {
            code: "internal",
            message: e.to_string(),
            details: None,
        })
}

fn handle_scan_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let fallback_now = state.clock.now();
    match scan_record(conn, &req.params, fallback_now) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_scanlog_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match scanlog_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scan.record" => Some(handle_scan_record(state, req)),
        "scanlog.list" => Some(handle_scanlog_list(state, req)),
        _ => None,
    }
}
