use crate::curriculum::{builtin_profiles, resolve_profile, GradeBoundary};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str, sheet_err};
use crate::ipc::types::{AppState, Request};
use crate::sheet;
use serde_json::json;

fn handle_profiles_list(_state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(&req.id, json!({ "profiles": builtin_profiles() }))
}

fn handle_profiles_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class = match sheet::load_class(conn, &class_id) {
        Ok(c) => c,
        Err(e) => return sheet_err(req, e),
    };
    match sheet::effective_profile(conn, &class) {
        Ok(effective) => ok(&req.id, json!(effective)),
        Err(e) => sheet_err(req, e),
    }
}

fn handle_profiles_set_boundaries(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw) = req.params.get("boundaries") else {
        return err(&req.id, "bad_params", "missing boundaries", None);
    };
    let table: Vec<GradeBoundary> = match serde_json::from_value(raw.clone()) {
        Ok(t) => t,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                "boundaries must be an array of { label, minPercent }",
                Some(json!({ "reason": e.to_string() })),
            )
        }
    };

    let class = match sheet::load_class(conn, &class_id) {
        Ok(c) => c,
        Err(e) => return sheet_err(req, e),
    };
    // Validate against the built-in profile so overrides never stack.
    let base = resolve_profile(&class.curriculum_type);
    if let Err(e) = base.with_boundaries(table.clone()) {
        return err(
            &req.id,
            "bad_params",
            e.to_string(),
            Some(json!({ "curriculum": base.id, "labels": base.labels })),
        );
    }

    let key = db::boundaries_settings_key(&class_id);
    if let Err(e) = db::settings_set_json(conn, &key, &json!(table)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(class_id = %class_id, bands = table.len(), "boundary override stored");

    match sheet::effective_profile(conn, &class) {
        Ok(effective) => ok(&req.id, json!(effective)),
        Err(e) => sheet_err(req, e),
    }
}

fn handle_profiles_clear_boundaries(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class = match sheet::load_class(conn, &class_id) {
        Ok(c) => c,
        Err(e) => return sheet_err(req, e),
    };
    let removed = match db::settings_delete(conn, &db::boundaries_settings_key(&class_id)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if removed {
        tracing::info!(class_id = %class_id, "boundary override cleared");
    }

    match sheet::effective_profile(conn, &class) {
        Ok(effective) => ok(
            &req.id,
            json!({ "removed": removed, "profile": effective.profile }),
        ),
        Err(e) => sheet_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "profiles.list" => Some(handle_profiles_list(state, req)),
        "profiles.get" => Some(handle_profiles_get(state, req)),
        "profiles.setBoundaries" => Some(handle_profiles_set_boundaries(state, req)),
        "profiles.clearBoundaries" => Some(handle_profiles_clear_boundaries(state, req)),
        _ => None,
    }
}
