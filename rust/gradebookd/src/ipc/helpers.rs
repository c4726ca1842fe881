use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::sheet::{SheetError, SheetScope};
use rusqlite::Connection;
use serde_json::json;

pub fn db_conn<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

/// Boolean capability/session flags default to false when absent.
pub fn flag(req: &Request, key: &str) -> bool {
    req.params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

pub fn sheet_err(req: &Request, e: SheetError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

pub fn parse_sheet_scope(req: &Request) -> Result<SheetScope, serde_json::Value> {
    let class_id = required_str(req, "classId")?;
    let term = required_i64(req, "term")?;
    let exam_type = required_str(req, "examType")?;

    let subject_ids = match req.params.get("subjectIds") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(arr) = v.as_array() else {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "subjectIds must be an array of strings",
                    None,
                ));
            };
            let mut ids = Vec::with_capacity(arr.len());
            for item in arr {
                let Some(s) = item.as_str() else {
                    return Err(err(
                        &req.id,
                        "bad_params",
                        "subjectIds must be an array of strings",
                        Some(json!({ "item": item })),
                    ));
                };
                ids.push(s.to_string());
            }
            Some(ids)
        }
    };

    Ok(SheetScope {
        class_id,
        term,
        exam_type,
        subject_ids,
    })
}
