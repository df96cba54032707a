use super::{
    flag, require, text_or_null, BatchItem, BatchReport, RowError, StoreError, StoreResult,
};
use crate::ident::{self, KeyEncoding};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceRow {
    pub schema_name: String,
    pub table_name: String,
    pub field_name: String,
    pub business_name: String,
    pub business_description: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetRow {
    pub schema_name: String,
    pub table_name: String,
    pub field_name: String,
    pub field_description: String,
    pub data_type: String,
    pub data_quality_info: String,
    pub primary_key: bool,
    pub mandatory: bool,
    /// `None` keeps whatever join clause is already stored.
    pub join_clause: Option<String>,
}

/// One grid row: a source field, a target field and the rule linking them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CatalogRow {
    #[serde(deserialize_with = "text_or_null")]
    pub source_schema: String,
    #[serde(deserialize_with = "text_or_null")]
    pub source_table: String,
    #[serde(deserialize_with = "text_or_null")]
    pub source_field: String,
    #[serde(deserialize_with = "text_or_null")]
    pub business_name: String,
    #[serde(deserialize_with = "text_or_null")]
    pub business_description: String,
    #[serde(deserialize_with = "text_or_null")]
    pub source_data_type: String,
    #[serde(deserialize_with = "text_or_null")]
    pub target_schema: String,
    #[serde(deserialize_with = "text_or_null")]
    pub target_table: String,
    #[serde(deserialize_with = "text_or_null")]
    pub target_field: String,
    #[serde(deserialize_with = "text_or_null")]
    pub field_description: String,
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
    pub join_clause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowIds {
    pub source_id: String,
    pub target_id: String,
    pub mapping_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub ids: RowIds,
    #[serde(flatten)]
    pub row: CatalogRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Inserted,
    Updated,
}

/// A single statement that failed while the rest of the row went ahead.
#[derive(Debug)]
pub struct StatementFailure {
    pub table: &'static str,
    pub error: StoreError,
}

impl CatalogRow {
    pub fn source(&self) -> SourceRow {
        SourceRow {
            schema_name: self.source_schema.clone(),
            table_name: self.source_table.clone(),
            field_name: self.source_field.clone(),
            business_name: self.business_name.clone(),
            business_description: self.business_description.clone(),
            data_type: self.source_data_type.clone(),
        }
    }

    pub fn target(&self) -> TargetRow {
        TargetRow {
            schema_name: self.target_schema.clone(),
            table_name: self.target_table.clone(),
            field_name: self.target_field.clone(),
            field_description: self.field_description.clone(),
            data_type: self.target_data_type.clone(),
            data_quality_info: self.data_quality_info.clone(),
            primary_key: self.primary_key,
            mandatory: self.mandatory,
            join_clause: self.join_clause.clone(),
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        let mut missing = Vec::new();
        require(&mut missing, "sourceSchema", &self.source_schema);
        require(&mut missing, "sourceTable", &self.source_table);
        require(&mut missing, "sourceField", &self.source_field);
        require(&mut missing, "targetSchema", &self.target_schema);
        require(&mut missing, "targetTable", &self.target_table);
        require(&mut missing, "targetField", &self.target_field);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Validation { missing })
        }
    }

    pub fn ids(&self, encoding: KeyEncoding) -> RowIds {
        let source_id = ident::source_id(
            encoding,
            &self.source_schema,
            &self.source_table,
            &self.source_field,
        );
        let target_id = ident::target_id(
            encoding,
            &self.target_schema,
            &self.target_table,
            &self.target_field,
        );
        let mapping_id = ident::mapping_id(encoding, &source_id, &target_id);
        RowIds {
            source_id,
            target_id,
            mapping_id,
        }
    }
}

// Each catalog statement commits or rolls back on its own.
fn in_tx<T>(
    conn: &Connection,
    f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
) -> StoreResult<T> {
    let tx = conn.unchecked_transaction()?;
    match f(&tx) {
        Ok(v) => {
            tx.commit()?;
            Ok(v)
        }
        Err(e) => {
            let _ = tx.rollback();
            Err(e.into())
        }
    }
}

pub fn upsert_source(conn: &Connection, source_id: &str, row: &SourceRow) -> StoreResult<Upserted> {
    in_tx(conn, |tx| {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM SourceMapping WHERE SourceID = ?",
                [source_id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            tx.execute(
                "INSERT INTO SourceMapping (SourceID, Schema_Name, Table_Name, Field_Name, Business_Name, Business_Description, Data_Type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    source_id,
                    row.schema_name,
                    row.table_name,
                    row.field_name,
                    row.business_name,
                    row.business_description,
                    row.data_type,
                ],
            )?;
            Ok(Upserted::Inserted)
        } else {
            tx.execute(
                "UPDATE SourceMapping
                 SET Schema_Name = ?1, Table_Name = ?2, Field_Name = ?3, Business_Name = ?4, Business_Description = ?5, Data_Type = ?6
                 WHERE SourceID = ?7",
                params![
                    row.schema_name,
                    row.table_name,
                    row.field_name,
                    row.business_name,
                    row.business_description,
                    row.data_type,
                    source_id,
                ],
            )?;
            Ok(Upserted::Updated)
        }
    })
}

pub fn upsert_target(conn: &Connection, target_id: &str, row: &TargetRow) -> StoreResult<Upserted> {
    in_tx(conn, |tx| {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM TargetMapping WHERE TargetID = ?",
                [target_id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            tx.execute(
                "INSERT INTO TargetMapping (TargetID, Schema_Name, Table_Name, Field_Name, Field_Description, Data_Type, Data_Quality_Info, Primary_Key, Mandatory, Join_Clause)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    target_id,
                    row.schema_name,
                    row.table_name,
                    row.field_name,
                    row.field_description,
                    row.data_type,
                    row.data_quality_info,
                    row.primary_key,
                    row.mandatory,
                    row.join_clause,
                ],
            )?;
            Ok(Upserted::Inserted)
        } else {
            tx.execute(
                "UPDATE TargetMapping
                 SET Schema_Name = ?1, Table_Name = ?2, Field_Name = ?3, Field_Description = ?4, Data_Type = ?5,
                     Data_Quality_Info = ?6, Primary_Key = ?7, Mandatory = ?8, Join_Clause = COALESCE(?9, Join_Clause)
                 WHERE TargetID = ?10",
                params![
                    row.schema_name,
                    row.table_name,
                    row.field_name,
                    row.field_description,
                    row.data_type,
                    row.data_quality_info,
                    row.primary_key,
                    row.mandatory,
                    row.join_clause,
                    target_id,
                ],
            )?;
            Ok(Upserted::Updated)
        }
    })
}

pub fn upsert_link(
    conn: &Connection,
    encoding: KeyEncoding,
    source_id: &str,
    target_id: &str,
    rule_id: &str,
) -> StoreResult<Upserted> {
    let mapping_id = ident::mapping_id(encoding, source_id, target_id);
    in_tx(conn, |tx| {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM SourceToTargetMapping WHERE MappingID = ?",
                [&mapping_id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            tx.execute(
                "INSERT INTO SourceToTargetMapping (MappingID, SourceID, TargetID, Transformation_Rule_ID)
                 VALUES (?1, ?2, ?3, ?4)",
                params![mapping_id, source_id, target_id, rule_id],
            )?;
            Ok(Upserted::Inserted)
        } else {
            tx.execute(
                "UPDATE SourceToTargetMapping
                 SET Transformation_Rule_ID = ?1
                 WHERE MappingID = ?2",
                params![rule_id, mapping_id],
            )?;
            Ok(Upserted::Updated)
        }
    })
}

/// Upserts source, target and link for one row. Returns the statements
/// that failed; the others are committed regardless.
pub fn save_row(conn: &Connection, encoding: KeyEncoding, row: &CatalogRow) -> Vec<StatementFailure> {
    let ids = row.ids(encoding);
    let mut failures = Vec::new();

    if let Err(error) = upsert_source(conn, &ids.source_id, &row.source()) {
        failures.push(StatementFailure {
            table: "SourceMapping",
            error,
        });
    }
    if let Err(error) = upsert_target(conn, &ids.target_id, &row.target()) {
        failures.push(StatementFailure {
            table: "TargetMapping",
            error,
        });
    }
    if let Err(error) = upsert_link(
        conn,
        encoding,
        &ids.source_id,
        &ids.target_id,
        &row.transformation_rule_id,
    ) {
        failures.push(StatementFailure {
            table: "SourceToTargetMapping",
            error,
        });
    }

    debug!(mapping_id = %ids.mapping_id, failed = failures.len(), "catalog row saved");
    failures
}

/// Removes the link row first, then the source and target rows it referenced.
pub fn delete_row(conn: &Connection, ids: &RowIds) -> Vec<StatementFailure> {
    let steps: [(&'static str, &str, &str); 3] = [
        (
            "SourceToTargetMapping",
            "DELETE FROM SourceToTargetMapping WHERE MappingID = ?",
            ids.mapping_id.as_str(),
        ),
        (
            "SourceMapping",
            "DELETE FROM SourceMapping WHERE SourceID = ?",
            ids.source_id.as_str(),
        ),
        (
            "TargetMapping",
            "DELETE FROM TargetMapping WHERE TargetID = ?",
            ids.target_id.as_str(),
        ),
    ];

    let mut failures = Vec::new();
    for (table, sql, id) in steps {
        if let Err(error) = in_tx(conn, |tx| tx.execute(sql, [id])) {
            failures.push(StatementFailure { table, error });
        }
    }
    debug!(mapping_id = %ids.mapping_id, failed = failures.len(), "catalog row deleted");
    failures
}

fn row_errors(row: usize, failures: Vec<StatementFailure>) -> Vec<RowError> {
    failures
        .into_iter()
        .map(|f| {
            error!(row, table = f.table, "catalog statement failed: {}", f.error);
            RowError {
                row,
                code: f.error.code().to_string(),
                message: f.error.to_string(),
                details: Some(json!({ "table": f.table })),
            }
        })
        .collect()
}

pub fn save_rows(
    conn: &Connection,
    encoding: KeyEncoding,
    rows: &[BatchItem<CatalogRow>],
) -> BatchReport {
    let mut report = BatchReport::default();
    for (i, item) in rows.iter().enumerate() {
        let row = match item {
            Ok(row) => row,
            Err(e) => {
                report.reject(e.clone());
                continue;
            }
        };
        if let Err(e) = row.validate() {
            report.reject(RowError::from_store(i, &e));
            continue;
        }
        let failures = save_row(conn, encoding, row);
        report.record(row_errors(i, failures));
    }
    report
}

pub fn delete_rows(
    conn: &Connection,
    encoding: KeyEncoding,
    rows: &[BatchItem<CatalogRow>],
) -> BatchReport {
    let mut report = BatchReport::default();
    for (i, item) in rows.iter().enumerate() {
        let row = match item {
            Ok(row) => row,
            Err(e) => {
                report.reject(e.clone());
                continue;
            }
        };
        if let Err(e) = row.validate() {
            report.reject(RowError::from_store(i, &e));
            continue;
        }
        let failures = delete_row(conn, &row.ids(encoding));
        report.record(row_errors(i, failures));
    }
    report
}

pub fn list(conn: &Connection) -> StoreResult<Vec<CatalogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT
           stm.MappingID, stm.SourceID, stm.TargetID,
           sm.Schema_Name, sm.Table_Name, sm.Field_Name,
           sm.Business_Name, sm.Business_Description, sm.Data_Type,
           tm.Schema_Name, tm.Table_Name, tm.Field_Name,
           tm.Field_Description, tm.Data_Type, tm.Data_Quality_Info, tm.Primary_Key, tm.Mandatory,
           stm.Transformation_Rule_ID, tm.Join_Clause
         FROM SourceToTargetMapping stm
         JOIN SourceMapping sm ON sm.SourceID = stm.SourceID
         JOIN TargetMapping tm ON tm.TargetID = stm.TargetID
         ORDER BY sm.Schema_Name, sm.Table_Name, sm.Field_Name,
                  tm.Schema_Name, tm.Table_Name, tm.Field_Name",
    )?;
    let rows = stmt
        .query_map([], |r| {
            let opt = |idx: usize| -> rusqlite::Result<String> {
                Ok(r.get::<_, Option<String>>(idx)?.unwrap_or_default())
            };
            Ok(CatalogEntry {
                ids: RowIds {
                    mapping_id: r.get(0)?,
                    source_id: r.get(1)?,
                    target_id: r.get(2)?,
                },
                row: CatalogRow {
                    source_schema: r.get(3)?,
                    source_table: r.get(4)?,
                    source_field: r.get(5)?,
                    business_name: opt(6)?,
                    business_description: opt(7)?,
                    source_data_type: opt(8)?,
                    target_schema: r.get(9)?,
                    target_table: r.get(10)?,
                    target_field: r.get(11)?,
                    field_description: opt(12)?,
                    target_data_type: opt(13)?,
                    data_quality_info: opt(14)?,
                    primary_key: r.get(15)?,
                    mandatory: r.get(16)?,
                    transformation_rule_id: opt(17)?,
                    join_clause: r.get(18)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
