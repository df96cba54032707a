use crate::ipc::error::{err, ok, store_err};
use crate::ipc::types::{AppState, Request};
use crate::store::history::{self, MappingRecord};
use crate::store::RowError;
use serde_json::json;

const CREATE_MANY_MAX_RECORDS: usize = 5000;

fn parse_record(req: &Request, value: Option<&serde_json::Value>) -> Result<MappingRecord, serde_json::Value> {
    let Some(v) = value.filter(|v| v.is_object()) else {
        return Err(err(&req.id, "bad_params", "missing record", None));
    };
    serde_json::from_value::<MappingRecord>(v.clone())
        .map_err(|e| err(&req.id, "bad_params", format!("invalid record: {}", e), None))
}

fn parse_id(req: &Request) -> Result<i64, serde_json::Value> {
    match req.params.get("id").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => Ok(v),
        _ => Err(err(&req.id, "bad_params", "missing/invalid id", None)),
    }
}

fn handle_mappings_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "mappings": [] }));
    };
    match history::fetch_current(conn) {
        Ok(rows) => ok(&req.id, json!({ "mappings": rows })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_mappings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "open a database first", None);
    };
    let id = match parse_id(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match history::get(conn, id) {
        Ok(v) => ok(&req.id, json!({ "mapping": v })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_mappings_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "open a database first", None);
    };
    let id = match parse_id(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match history::history(conn, id) {
        Ok(versions) => ok(&req.id, json!({ "versions": versions })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_mappings_is_duplicate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "open a database first", None);
    };
    let record = match parse_record(req, req.params.get("record")) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match history::is_duplicate(conn, &record.natural_key()) {
        Ok(duplicate) => ok(&req.id, json!({ "duplicate": duplicate })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_mappings_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "open a database first", None);
    };
    let record = match parse_record(req, req.params.get("record")) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match history::insert(conn, &record) {
        Ok(id) => ok(&req.id, json!({ "id": id })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_mappings_create_many(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "open a database first", None);
    };
    let Some(records_arr) = req.params.get("records").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing records[]", None);
    };
    if records_arr.len() > CREATE_MANY_MAX_RECORDS {
        return err(
            &req.id,
            "bad_params",
            format!(
                "batch exceeds max records: {} > {}",
                records_arr.len(),
                CREATE_MANY_MAX_RECORDS
            ),
            Some(json!({ "max": CREATE_MANY_MAX_RECORDS })),
        );
    }

    let records: Vec<_> = records_arr
        .iter()
        .enumerate()
        .map(|(i, v)| {
            serde_json::from_value::<MappingRecord>(v.clone())
                .map_err(|e| {
                    RowError::unreadable(i, format!("record {} is not a mapping: {}", i, e))
                })
        })
        .collect();

    let report = history::insert_many(conn, &records);
    ok(&req.id, json!(report))
}

fn handle_mappings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "open a database first", None);
    };
    let id = match parse_id(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let record = match parse_record(req, req.params.get("record")) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match history::update(conn, id, &record) {
        Ok(new_id) => ok(&req.id, json!({ "id": new_id, "supersedesId": id })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_mappings_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "open a database first", None);
    };
    let id = match parse_id(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match history::soft_delete(conn, id) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => store_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "mappings.list" => Some(handle_mappings_list(state, req)),
        "mappings.get" => Some(handle_mappings_get(state, req)),
        "mappings.history" => Some(handle_mappings_history(state, req)),
        "mappings.isDuplicate" => Some(handle_mappings_is_duplicate(state, req)),
        "mappings.create" => Some(handle_mappings_create(state, req)),
        "mappings.createMany" => Some(handle_mappings_create_many(state, req)),
        "mappings.update" => Some(handle_mappings_update(state, req)),
        "mappings.delete" => Some(handle_mappings_delete(state, req)),
        _ => None,
    }
}
