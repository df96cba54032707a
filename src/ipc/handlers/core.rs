use crate::db;
use crate::ident;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "databasePath": state.db_path.as_ref().map(|p| p.to_string_lossy().to_string()),
            "keyEncoding": state.key_encoding.as_str(),
        }),
    )
}

fn handle_database_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            info!(path = %path.to_string_lossy(), "database opened");
            state.db_path = Some(path.clone());
            state.db = Some(conn);
            ok(&req.id, json!({ "databasePath": path.to_string_lossy() }))
        }
        Err(e) => {
            error!(path = %path.to_string_lossy(), "database open failed: {e:#}");
            err(&req.id, "db_open_failed", format!("{e:#}"), None)
        }
    }
}

fn handle_ids_derive(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(parts) = req.params.get("parts").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing parts[]", None);
    };

    // Numbers and booleans are hashed by their JSON text.
    let mut values: Vec<String> = Vec::with_capacity(parts.len());
    for (i, p) in parts.iter().enumerate() {
        match p {
            serde_json::Value::String(s) => values.push(s.clone()),
            serde_json::Value::Number(n) => values.push(n.to_string()),
            serde_json::Value::Bool(b) => values.push(b.to_string()),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "parts must be strings, numbers or booleans",
                    Some(json!({ "index": i })),
                )
            }
        }
    }

    ok(
        &req.id,
        json!({ "id": ident::derive(state.key_encoding, &values) }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "database.open" => Some(handle_database_open(state, req)),
        "ids.derive" => Some(handle_ids_derive(state, req)),
        _ => None,
    }
}
