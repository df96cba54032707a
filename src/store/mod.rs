pub mod catalog;
pub mod history;

use chrono::{SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate entry for natural key {key}")]
    DuplicateKey { key: String },

    #[error("missing required fields: {}", .missing.join(", "))]
    Validation { missing: Vec<&'static str> },

    #[error("mapping {id} not found or no longer current")]
    NotFound { id: i64 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::DuplicateKey { .. } => "duplicate_key",
            StoreError::Validation { .. } => "validation_failed",
            StoreError::NotFound { .. } => "not_found",
            StoreError::Database(_) => "db_error",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            StoreError::DuplicateKey { key } => Some(json!({ "key": key })),
            StoreError::Validation { missing } => Some(json!({ "missing": missing })),
            StoreError::NotFound { id } => Some(json!({ "id": id })),
            StoreError::Database(_) => None,
        }
    }

    pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
        matches!(
            e,
            rusqlite::Error::SqliteFailure(f, _)
                if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A batch entry as it arrived: parsed, or already rejected at the boundary.
pub type BatchItem<T> = Result<T, RowError>;

/// Per-row outcome of a batch; a failed row never stops the rows after it.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowError {
    pub row: usize,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RowError {
    pub fn from_store(row: usize, e: &StoreError) -> Self {
        Self {
            row,
            code: e.code().to_string(),
            message: e.to_string(),
            details: e.details(),
        }
    }

    /// A row whose payload could not be read as a record.
    pub fn unreadable(row: usize, message: impl Into<String>) -> Self {
        Self {
            row,
            code: "validation_failed".to_string(),
            message: message.into(),
            details: None,
        }
    }
}

impl BatchReport {
    pub(crate) fn record(&mut self, row_errors: Vec<RowError>) {
        self.processed += 1;
        if row_errors.is_empty() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
            self.errors.extend(row_errors);
        }
    }

    pub(crate) fn reject(&mut self, e: RowError) {
        warn!(row = e.row, code = %e.code, "batch row skipped: {}", e.message);
        self.record(vec![e]);
    }
}

/// Empty grid cells arrive as `null`.
pub(crate) fn text_or_null<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

/// Flags arrive as booleans or as 0/1 integers.
pub(crate) fn flag<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(d)? {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(b),
        Some(Value::Number(n)) if n.as_i64().is_some() => Ok(n.as_i64() != Some(0)),
        Some(other) => Err(D::Error::custom(format!(
            "expected a boolean or 0/1, got {other}"
        ))),
    }
}

pub(crate) fn require(missing: &mut Vec<&'static str>, name: &'static str, value: &str) {
    if value.trim().is_empty() {
        missing.push(name);
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
