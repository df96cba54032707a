use crate::ipc::error::{err, ok, store_err};
use crate::ipc::types::{AppState, Request};
use crate::store::catalog::{self, CatalogRow};
use crate::store::{BatchItem, RowError};
use serde_json::json;

const CATALOG_BATCH_MAX_ROWS: usize = 5000;

fn parse_rows(req: &Request) -> Result<Vec<BatchItem<CatalogRow>>, serde_json::Value> {
    let Some(rows_arr) = req.params.get("rows").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "missing rows[]", None));
    };
    if rows_arr.len() > CATALOG_BATCH_MAX_ROWS {
        return Err(err(
            &req.id,
            "bad_params",
            format!(
                "batch exceeds max rows: {} > {}",
                rows_arr.len(),
                CATALOG_BATCH_MAX_ROWS
            ),
            Some(json!({ "max": CATALOG_BATCH_MAX_ROWS })),
        ));
    }

    // A row that does not read as a catalog row fails alone.
    let rows = rows_arr
        .iter()
        .enumerate()
        .map(|(i, v)| {
            serde_json::from_value::<CatalogRow>(v.clone())
                .map_err(|e| {
                    RowError::unreadable(i, format!("row {} is not a catalog row: {}", i, e))
                })
        })
        .collect();
    Ok(rows)
}

fn handle_catalog_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "rows": [] }));
    };
    match catalog::list(conn) {
        Ok(rows) => ok(&req.id, json!({ "rows": rows })),
        Err(e) => store_err(&req.id, &e),
    }
}

fn handle_catalog_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "open a database first", None);
    };
    let rows = match parse_rows(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let report = catalog::save_rows(conn, state.key_encoding, &rows);
    ok(&req.id, json!(report))
}

fn handle_catalog_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_database", "open a database first", None);
    };
    let rows = match parse_rows(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let report = catalog::delete_rows(conn, state.key_encoding, &rows);
    ok(&req.id, json!(report))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "catalog.list" => Some(handle_catalog_list(state, req)),
        "catalog.save" => Some(handle_catalog_save(state, req)),
        "catalog.delete" => Some(handle_catalog_delete(state, req)),
        _ => None,
    }
}
