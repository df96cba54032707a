//! Single-table mapping store with row versioning.
//!
//! A logical mapping is never edited in place: an update closes the current
//! row (`is_current = 0`, `valid_to = now`) and inserts its replacement in the
//! same transaction, linked back through `supersedes_id`.

use super::{
    flag, now_rfc3339, require, text_or_null, BatchItem, BatchReport, RowError, StoreError,
    StoreResult,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MappingRecord {
    #[serde(deserialize_with = "text_or_null")]
    pub malcode: String,
    #[serde(deserialize_with = "text_or_null")]
    pub schema_name: String,
    #[serde(deserialize_with = "text_or_null")]
    pub table_name: String,
    #[serde(deserialize_with = "text_or_null")]
    pub field_name: String,
    #[serde(deserialize_with = "text_or_null")]
    pub source_field_description: String,
    #[serde(deserialize_with = "text_or_null")]
    pub source_business_name: String,
    #[serde(deserialize_with = "text_or_null")]
    pub source_business_description: String,
    #[serde(deserialize_with = "text_or_null")]
    pub source_data_type: String,
    #[serde(deserialize_with = "text_or_null")]
    pub target_table_name: String,
    #[serde(deserialize_with = "text_or_null")]
    pub target_field_name: String,
    #[serde(deserialize_with = "text_or_null")]
    pub target_field_description: String,
    #[serde(deserialize_with = "text_or_null")]
    pub target_business_name: String,
    #[serde(deserialize_with = "text_or_null")]
    pub target_business_description: String,
    #[serde(deserialize_with = "text_or_null")]
    pub target_data_type: String,
    #[serde(deserialize_with = "text_or_null")]
    pub data_quality_info: String,
    #[serde(deserialize_with = "flag")]
    pub primary_key: bool,
    #[serde(deserialize_with = "flag")]
    pub mandatory: bool,
    #[serde(deserialize_with = "text_or_null")]
    pub transformation_rule_id: String,
    #[serde(deserialize_with = "text_or_null")]
    pub transformation_description: String,
    #[serde(deserialize_with = "text_or_null")]
    pub join_clause: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NaturalKey {
    pub malcode: String,
    pub schema_name: String,
    pub table_name: String,
    pub field_name: String,
    pub target_table_name: String,
    pub target_field_name: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{}.{} -> {}.{}",
            self.malcode,
            self.schema_name,
            self.table_name,
            self.field_name,
            self.target_table_name,
            self.target_field_name
        )
    }
}

impl MappingRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            malcode: self.malcode.clone(),
            schema_name: self.schema_name.clone(),
            table_name: self.table_name.clone(),
            field_name: self.field_name.clone(),
            target_table_name: self.target_table_name.clone(),
            target_field_name: self.target_field_name.clone(),
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        let mut missing = Vec::new();
        require(&mut missing, "malcode", &self.malcode);
        require(&mut missing, "schemaName", &self.schema_name);
        require(&mut missing, "tableName", &self.table_name);
        require(&mut missing, "fieldName", &self.field_name);
        require(&mut missing, "targetTableName", &self.target_table_name);
        require(&mut missing, "targetFieldName", &self.target_field_name);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Validation { missing })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingVersion {
    pub id: i64,
    #[serde(flatten)]
    pub record: MappingRecord,
    pub valid_from: String,
    pub valid_to: Option<String>,
    pub is_current: bool,
    pub supersedes_id: Option<i64>,
}

const SELECT_COLUMNS: &str = "SELECT
    id, malcode, schema_name, table_name, field_name,
    source_field_description, source_business_name,
    source_business_description, source_data_type,
    target_table_name, target_field_name, target_field_description, target_business_name,
    target_business_description, target_data_type,
    data_quality_info, primary_key, mandatory,
    transformation_rule_id, transformation_description, join_clause,
    valid_from, valid_to, is_current, supersedes_id
  FROM data_mapping";

fn text(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<MappingVersion> {
    Ok(MappingVersion {
        id: row.get(0)?,
        record: MappingRecord {
            malcode: text(row, 1)?,
            schema_name: text(row, 2)?,
            table_name: text(row, 3)?,
            field_name: text(row, 4)?,
            source_field_description: text(row, 5)?,
            source_business_name: text(row, 6)?,
            source_business_description: text(row, 7)?,
            source_data_type: text(row, 8)?,
            target_table_name: text(row, 9)?,
            target_field_name: text(row, 10)?,
            target_field_description: text(row, 11)?,
            target_business_name: text(row, 12)?,
            target_business_description: text(row, 13)?,
            target_data_type: text(row, 14)?,
            data_quality_info: text(row, 15)?,
            primary_key: row.get(16)?,
            mandatory: row.get(17)?,
            transformation_rule_id: text(row, 18)?,
            transformation_description: text(row, 19)?,
            join_clause: text(row, 20)?,
        },
        valid_from: row.get(21)?,
        valid_to: row.get(22)?,
        is_current: row.get(23)?,
        supersedes_id: row.get(24)?,
    })
}

pub fn fetch_current(conn: &Connection) -> StoreResult<Vec<MappingVersion>> {
    let sql = format!("{SELECT_COLUMNS} WHERE is_current = 1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], version_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get(conn: &Connection, id: i64) -> StoreResult<MappingVersion> {
    let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
    conn.query_row(&sql, [id], version_from_row)
        .optional()?
        .ok_or(StoreError::NotFound { id })
}

fn count_current(conn: &Connection, key: &NaturalKey, exclude_id: Option<i64>) -> StoreResult<i64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM data_mapping
         WHERE is_current = 1
           AND malcode = ?1 AND schema_name = ?2 AND table_name = ?3 AND field_name = ?4
           AND target_table_name = ?5 AND target_field_name = ?6
           AND (?7 IS NULL OR id <> ?7)",
        params![
            key.malcode,
            key.schema_name,
            key.table_name,
            key.field_name,
            key.target_table_name,
            key.target_field_name,
            exclude_id,
        ],
        |r| r.get(0),
    )?;
    Ok(n)
}

pub fn is_duplicate(conn: &Connection, key: &NaturalKey) -> StoreResult<bool> {
    Ok(count_current(conn, key, None)? > 0)
}

fn insert_version(
    conn: &Connection,
    record: &MappingRecord,
    valid_from: &str,
    supersedes_id: Option<i64>,
) -> StoreResult<i64> {
    let res = conn.execute(
        "INSERT INTO data_mapping (
            malcode, schema_name, table_name, field_name,
            source_field_description, source_business_name,
            source_business_description, source_data_type,
            target_table_name, target_field_name, target_field_description, target_business_name,
            target_business_description, target_data_type,
            data_quality_info, primary_key, mandatory,
            transformation_rule_id, transformation_description,
            join_clause, valid_from, valid_to, is_current, supersedes_id
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21, NULL, 1, ?22)",
        params![
            record.malcode,
            record.schema_name,
            record.table_name,
            record.field_name,
            record.source_field_description,
            record.source_business_name,
            record.source_business_description,
            record.source_data_type,
            record.target_table_name,
            record.target_field_name,
            record.target_field_description,
            record.target_business_name,
            record.target_business_description,
            record.target_data_type,
            record.data_quality_info,
            record.primary_key,
            record.mandatory,
            record.transformation_rule_id,
            record.transformation_description,
            record.join_clause,
            valid_from,
            supersedes_id,
        ],
    );
    match res {
        Ok(_) => Ok(conn.last_insert_rowid()),
        // Another session inserted the same key between our check and write.
        Err(e) if StoreError::is_unique_violation(&e) => Err(StoreError::DuplicateKey {
            key: record.natural_key().to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

pub fn insert(conn: &Connection, record: &MappingRecord) -> StoreResult<i64> {
    record.validate()?;
    let key = record.natural_key();
    if is_duplicate(conn, &key)? {
        return Err(StoreError::DuplicateKey {
            key: key.to_string(),
        });
    }
    let id = insert_version(conn, record, &now_rfc3339(), None)?;
    debug!(id, key = %key, "mapping inserted");
    Ok(id)
}

/// Replaces current row `id` with a new version holding `record`.
/// Returns the id of the new current row.
pub fn update(conn: &Connection, id: i64, record: &MappingRecord) -> StoreResult<i64> {
    record.validate()?;
    let key = record.natural_key();

    // Dropping `tx` on any early return rolls it back.
    let tx = conn.unchecked_transaction()?;

    let is_current: Option<bool> = tx
        .query_row(
            "SELECT is_current FROM data_mapping WHERE id = ?",
            [id],
            |r| r.get(0),
        )
        .optional()?;
    if is_current != Some(true) {
        return Err(StoreError::NotFound { id });
    }

    if count_current(&tx, &key, Some(id))? > 0 {
        return Err(StoreError::DuplicateKey {
            key: key.to_string(),
        });
    }

    let now = now_rfc3339();
    tx.execute(
        "UPDATE data_mapping
         SET is_current = 0, valid_to = ?1
         WHERE id = ?2 AND is_current = 1",
        params![now, id],
    )?;
    let new_id = insert_version(&tx, record, &now, Some(id))?;
    tx.commit()?;

    debug!(old_id = id, new_id, key = %key, "mapping versioned");
    Ok(new_id)
}

pub fn soft_delete(conn: &Connection, id: i64) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE data_mapping
         SET is_current = 0, valid_to = ?1
         WHERE id = ?2 AND is_current = 1",
        params![now_rfc3339(), id],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound { id });
    }
    debug!(id, "mapping soft-deleted");
    Ok(())
}

/// Inserts each record independently. Duplicates and invalid rows are
/// reported and skipped.
pub fn insert_many(conn: &Connection, records: &[BatchItem<MappingRecord>]) -> BatchReport {
    let mut report = BatchReport::default();
    for (i, item) in records.iter().enumerate() {
        let record = match item {
            Ok(record) => record,
            Err(e) => {
                report.reject(e.clone());
                continue;
            }
        };
        match insert(conn, record) {
            Ok(_) => report.record(Vec::new()),
            Err(e) => {
                warn!(row = i, code = e.code(), "mapping row skipped: {e}");
                report.record(vec![RowError::from_store(i, &e)]);
            }
        }
    }
    report
}

/// Every version in the chain that contains `id`, oldest first.
pub fn history(conn: &Connection, id: i64) -> StoreResult<Vec<MappingVersion>> {
    let start = get(conn, id)?;

    let mut older = Vec::new();
    let mut prev = start.supersedes_id;
    while let Some(prev_id) = prev {
        let v = get(conn, prev_id)?;
        prev = v.supersedes_id;
        older.push(v);
    }
    older.reverse();

    let mut chain = older;
    let mut last_id = start.id;
    chain.push(start);

    let sql = format!("{SELECT_COLUMNS} WHERE supersedes_id = ?");
    while let Some(next) = conn
        .query_row(&sql, [last_id], version_from_row)
        .optional()?
    {
        last_id = next.id;
        chain.push(next);
    }
    Ok(chain)
}
