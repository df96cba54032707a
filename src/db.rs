use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;

pub fn open_db(db_path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS SourceMapping(
            SourceID TEXT PRIMARY KEY,
            Schema_Name TEXT NOT NULL,
            Table_Name TEXT NOT NULL,
            Field_Name TEXT NOT NULL,
            Business_Name TEXT,
            Business_Description TEXT,
            Data_Type TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS TargetMapping(
            TargetID TEXT PRIMARY KEY,
            Schema_Name TEXT NOT NULL,
            Table_Name TEXT NOT NULL,
            Field_Name TEXT NOT NULL,
            Field_Description TEXT,
            Data_Type TEXT,
            Data_Quality_Info TEXT,
            Primary_Key INTEGER NOT NULL DEFAULT 0,
            Mandatory INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    // Catalogs created before join clauses were tracked lack this column.
    ensure_target_join_clause(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS SourceToTargetMapping(
            MappingID TEXT PRIMARY KEY,
            SourceID TEXT NOT NULL,
            TargetID TEXT NOT NULL,
            Transformation_Rule_ID TEXT,
            FOREIGN KEY(SourceID) REFERENCES SourceMapping(SourceID),
            FOREIGN KEY(TargetID) REFERENCES TargetMapping(TargetID),
            UNIQUE(SourceID, TargetID)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stm_source ON SourceToTargetMapping(SourceID)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stm_target ON SourceToTargetMapping(TargetID)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS data_mapping(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            malcode TEXT NOT NULL,
            schema_name TEXT NOT NULL,
            table_name TEXT NOT NULL,
            field_name TEXT NOT NULL,
            source_field_description TEXT,
            source_business_name TEXT,
            source_business_description TEXT,
            source_data_type TEXT,
            target_table_name TEXT NOT NULL,
            target_field_name TEXT NOT NULL,
            target_field_description TEXT,
            target_business_name TEXT,
            target_business_description TEXT,
            target_data_type TEXT,
            data_quality_info TEXT,
            primary_key INTEGER NOT NULL DEFAULT 0,
            mandatory INTEGER NOT NULL DEFAULT 0,
            transformation_rule_id TEXT,
            transformation_description TEXT,
            join_clause TEXT,
            valid_from TEXT NOT NULL,
            valid_to TEXT,
            is_current INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    ensure_data_mapping_supersedes_id(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_data_mapping_current ON data_mapping(is_current)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_data_mapping_supersedes ON data_mapping(supersedes_id)",
        [],
    )?;
    // At most one current version per natural key.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_data_mapping_current_key ON data_mapping(
            malcode, schema_name, table_name, field_name, target_table_name, target_field_name
         ) WHERE is_current = 1",
        [],
    )?;

    Ok(())
}

fn ensure_target_join_clause(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "TargetMapping", "Join_Clause")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE TargetMapping ADD COLUMN Join_Clause TEXT", [])?;
    Ok(())
}

fn ensure_data_mapping_supersedes_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "data_mapping", "supersedes_id")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE data_mapping ADD COLUMN supersedes_id INTEGER REFERENCES data_mapping(id)",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("first init");
        init_schema(&conn).expect("second init");
        assert!(table_has_column(&conn, "TargetMapping", "Join_Clause").expect("pragma"));
        assert!(table_has_column(&conn, "data_mapping", "supersedes_id").expect("pragma"));
    }

    #[test]
    fn connection_waits_on_locks_and_enforces_foreign_keys() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("init");
        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |r| r.get(0))
            .expect("busy_timeout");
        assert_eq!(timeout, 5000);
        let fks: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
            .expect("foreign_keys");
        assert_eq!(fks, 1);
    }

    #[test]
    fn older_catalog_gains_missing_columns() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute(
            "CREATE TABLE TargetMapping(
                TargetID TEXT PRIMARY KEY,
                Schema_Name TEXT NOT NULL,
                Table_Name TEXT NOT NULL,
                Field_Name TEXT NOT NULL,
                Field_Description TEXT,
                Data_Type TEXT,
                Data_Quality_Info TEXT,
                Primary_Key INTEGER NOT NULL DEFAULT 0,
                Mandatory INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .expect("legacy table");
        assert!(!table_has_column(&conn, "TargetMapping", "Join_Clause").expect("pragma"));
        init_schema(&conn).expect("init");
        assert!(table_has_column(&conn, "TargetMapping", "Join_Clause").expect("pragma"));
    }

    #[test]
    fn open_db_creates_parent_directories() {
        let dir = std::env::temp_dir().join(format!(
            "mappingd-db-open-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let path = dir.join("nested").join("catalog.sqlite3");
        let _conn = open_db(&path).expect("open");
        assert!(path.is_file());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
