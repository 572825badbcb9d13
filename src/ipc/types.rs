use std::path::PathBuf;

use crate::clock::Clock;
use crate::sync::SyncCoordinator;
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub clock: Box<dyn Clock>,
    pub coordinator: SyncCoordinator,
}
