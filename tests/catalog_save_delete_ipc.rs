use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_mappingd");
    let mut child = Command::new(exe)
        .env_remove("MAPPINGD_CONFIG")
        .env_remove("MAPPINGD_DATABASE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn mappingd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn grid_row(source_field: &str, target_table: &str) -> serde_json::Value {
    json!({
        "sourceSchema": "dbo",
        "sourceTable": "Customer",
        "sourceField": source_field,
        "businessName": "Customer attribute",
        "businessDescription": "",
        "sourceDataType": "nvarchar(255)",
        "targetSchema": "dw",
        "targetTable": target_table,
        "targetField": source_field,
        "fieldDescription": "",
        "targetDataType": "varchar(255)",
        "dataQualityInfo": "not null",
        "primaryKey": false,
        "mandatory": true,
        "transformationRuleId": "TR-001"
    })
}

fn list_rows(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
) -> Vec<serde_json::Value> {
    request_ok(stdin, reader, id, "catalog.list", json!({}))
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("rows")
}

#[test]
fn save_list_and_delete_catalog_rows() {
    let workspace = temp_dir("mappingd-catalog");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "database.open",
        json!({ "path": workspace.join("catalog.sqlite3").to_string_lossy() }),
    );

    let mut invalid = grid_row("Email", "Cust");
    invalid["targetField"] = json!("");
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "catalog.save",
        json!({ "rows": [grid_row("Email", "Cust"), invalid, grid_row("Phone", "Cust")] }),
    );
    assert_eq!(report.get("processed"), Some(&json!(3)));
    assert_eq!(report.get("succeeded"), Some(&json!(2)));
    assert_eq!(report.get("failed"), Some(&json!(1)));
    assert_eq!(report.pointer("/errors/0/row"), Some(&json!(1)));
    assert_eq!(
        report.pointer("/errors/0/code"),
        Some(&json!("validation_failed"))
    );

    let rows = list_rows(&mut stdin, &mut reader, "3");
    assert_eq!(rows.len(), 2);
    let email = rows
        .iter()
        .find(|r| r.get("sourceField") == Some(&json!("Email")))
        .expect("email row");

    // Identifiers are the hashes of the natural keys.
    let source_id = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "ids.derive",
        json!({ "parts": ["dbo", "Customer", "Email"] }),
    );
    assert_eq!(email.get("sourceId"), source_id.get("id"));
    let target_id = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "ids.derive",
        json!({ "parts": ["dw", "Cust", "Email"] }),
    );
    assert_eq!(email.get("targetId"), target_id.get("id"));
    let mapping_id = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "ids.derive",
        json!({ "parts": [source_id.get("id"), target_id.get("id")] }),
    );
    assert_eq!(email.get("mappingId"), mapping_id.get("id"));

    // Saving again rewrites attributes without duplicating the link.
    let mut edited = grid_row("Email", "Cust");
    edited["transformationRuleId"] = json!("TR-009");
    edited["joinClause"] = json!("c.CustomerKey = s.CustomerID");
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "catalog.save",
        json!({ "rows": [edited] }),
    );
    assert_eq!(report.get("succeeded"), Some(&json!(1)));
    let rows = list_rows(&mut stdin, &mut reader, "8");
    assert_eq!(rows.len(), 2);
    let email = rows
        .iter()
        .find(|r| r.get("sourceField") == Some(&json!("Email")))
        .expect("email row");
    assert_eq!(email.get("transformationRuleId"), Some(&json!("TR-009")));
    assert_eq!(
        email.get("joinClause"),
        Some(&json!("c.CustomerKey = s.CustomerID"))
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "catalog.delete",
        json!({ "rows": [grid_row("Email", "Cust")] }),
    );
    assert_eq!(report.get("succeeded"), Some(&json!(1)));
    let rows = list_rows(&mut stdin, &mut reader, "10");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("sourceField"), Some(&json!("Phone")));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleting_a_row_with_a_shared_source_reports_and_continues() {
    let workspace = temp_dir("mappingd-catalog-shared");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "database.open",
        json!({ "path": workspace.join("catalog.sqlite3").to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "catalog.save",
        json!({ "rows": [grid_row("Email", "Cust"), grid_row("Email", "Contact"), grid_row("Phone", "Cust")] }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "catalog.delete",
        json!({ "rows": [grid_row("Email", "Cust"), grid_row("Phone", "Cust")] }),
    );
    assert_eq!(report.get("processed"), Some(&json!(2)));
    assert_eq!(report.get("failed"), Some(&json!(1)));
    assert_eq!(report.get("succeeded"), Some(&json!(1)));
    assert_eq!(report.pointer("/errors/0/row"), Some(&json!(0)));
    assert_eq!(report.pointer("/errors/0/code"), Some(&json!("db_error")));
    assert_eq!(
        report.pointer("/errors/0/details/table"),
        Some(&json!("SourceMapping"))
    );

    let rows = list_rows(&mut stdin, &mut reader, "4");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("targetTable"), Some(&json!("Contact")));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn save_keeps_valid_rows_when_a_row_cannot_be_read() {
    let workspace = temp_dir("mappingd-catalog-cells");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "database.open",
        json!({ "path": workspace.join("catalog.sqlite3").to_string_lossy() }),
    );

    let mut sparse = grid_row("Phone", "Cust");
    sparse["businessDescription"] = json!(null);
    sparse["joinClause"] = json!(null);
    sparse["primaryKey"] = json!(1);
    sparse["mandatory"] = json!(0);
    let mut unreadable = grid_row("Fax", "Cust");
    unreadable["sourceField"] = json!(["Fax"]);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "catalog.save",
        json!({ "rows": [grid_row("Email", "Cust"), unreadable, sparse] }),
    );
    assert_eq!(report.get("processed"), Some(&json!(3)));
    assert_eq!(report.get("succeeded"), Some(&json!(2)));
    assert_eq!(report.get("failed"), Some(&json!(1)));
    assert_eq!(report.pointer("/errors/0/row"), Some(&json!(1)));
    assert_eq!(
        report.pointer("/errors/0/code"),
        Some(&json!("validation_failed"))
    );

    let rows = list_rows(&mut stdin, &mut reader, "3");
    assert_eq!(rows.len(), 2);
    let phone = rows
        .iter()
        .find(|r| r.get("sourceField") == Some(&json!("Phone")))
        .expect("phone row");
    assert_eq!(phone.get("primaryKey"), Some(&json!(true)));
    assert_eq!(phone.get("mandatory"), Some(&json!(false)));
    assert_eq!(phone.get("businessDescription"), Some(&json!("")));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
