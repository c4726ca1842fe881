use crate::backup;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::core::select_workspace;
use crate::ipc::helpers::optional_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn target_workspace(state: &AppState, req: &Request) -> Result<PathBuf, serde_json::Value> {
    optional_str(req, "workspacePath")
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn handle_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(out_path) = optional_str(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let workspace_path = match target_workspace(state, req) {
        Ok(p) => p,
        Err(e) => return e,
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    match backup::export_workspace_bundle(&workspace_path, &PathBuf::from(&out_path)) {
        Ok(export) => ok(
            &req.id,
            json!({
                "path": out_path,
                "bundleFormat": export.bundle_format,
                "entryCount": export.entry_count,
                "dbSha256": export.db_sha256
            }),
        ),
        Err(e) => {
            tracing::error!(out = %out_path, error = %e, "bundle export failed");
            err(&req.id, "io_failed", e.to_string(), Some(json!({ "path": out_path })))
        }
    }
}

fn handle_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(in_path) = optional_str(req, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let workspace_path = match target_workspace(state, req) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    let is_active = state.workspace.as_deref() == Some(workspace_path.as_path());
    if is_active {
        // The live handle must be closed before its file is swapped out.
        state.db = None;
    }

    let imported = backup::import_workspace_bundle(&src, &workspace_path);
    // Reopen whatever is on disk now, even after a failed import.
    let reopened = if is_active {
        select_workspace(state, &workspace_path)
    } else {
        Ok(())
    };

    let import = match imported {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(bundle = %in_path, error = %e, "bundle import failed");
            return err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": in_path })),
            );
        }
    };
    if let Err(e) = reopened {
        return err(
            &req.id,
            "db_open_failed",
            format!("{e:#}"),
            Some(json!({ "path": workspace_path.to_string_lossy() })),
        );
    }

    tracing::info!(
        bundle = %in_path,
        workspace = %workspace_path.display(),
        format = %import.bundle_format_detected,
        "workspace bundle imported"
    );
    ok(
        &req.id,
        json!({
            "workspacePath": workspace_path.to_string_lossy(),
            "bundleFormatDetected": import.bundle_format_detected,
            "dbSha256": import.db_sha256
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import(state, req)),
        _ => None,
    }
}
