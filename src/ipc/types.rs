use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::field_types::FieldTypeRegistry;

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
    pub registry: FieldTypeRegistry,
}

impl AppState {
    pub fn new(registry: FieldTypeRegistry) -> Self {
        Self {
            workspace: None,
            db: None,
            registry,
        }
    }
}
