use crate::ident::KeyEncoding;
use rusqlite::Connection;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub db_path: Option<PathBuf>,
    pub db: Option<Connection>,
    pub key_encoding: KeyEncoding,
}
