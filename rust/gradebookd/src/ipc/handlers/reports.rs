use crate::calc::{self, ComponentScores};
use crate::curriculum::resolve_profile;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, parse_sheet_scope, required_str, sheet_err};
use crate::ipc::types::{AppState, Request};
use crate::sheet;
use serde_json::json;

fn handle_class_statistics(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scope = match parse_sheet_scope(req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    match sheet::build_sheet(conn, &scope, true) {
        Ok(model) => ok(
            &req.id,
            json!({
                "classId": model.class.id,
                "term": model.term,
                "examType": model.exam_type,
                "statistics": model.statistics
            }),
        ),
        Err(e) => sheet_err(req, e),
    }
}

/// Derives a grade for ad-hoc scores without touching storage. The profile
/// comes from a class (including its boundary override) or a bare token.
fn handle_preview_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scores: ComponentScores = match req.params.get("componentScores") {
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(s) => s,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    "componentScores must map component names to numbers or \"absent\"",
                    Some(json!({ "reason": e.to_string() })),
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing componentScores", None),
    };

    let profile = match optional_str(req, "classId") {
        Some(class_id) => {
            let conn = match db_conn(state, req) {
                Ok(c) => c,
                Err(e) => return e,
            };
            let effective = sheet::load_class(conn, &class_id)
                .and_then(|class| sheet::effective_profile(conn, &class));
            match effective {
                Ok(e) => e.profile,
                Err(e) => return sheet_err(req, e),
            }
        }
        None => resolve_profile(&optional_str(req, "curriculumType").unwrap_or_default()),
    };

    let grade = calc::derive_grade(&scores, &profile);
    let mut out = json!(grade);
    out["curriculum"] = json!(profile.id);
    out["componentScores"] = json!(scores);
    ok(&req.id, out)
}

fn handle_student_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scope = match parse_sheet_scope(req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match sheet::build_student_report(conn, &scope, &student_id) {
        Ok(report) => ok(&req.id, json!(report)),
        Err(e) => sheet_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calc.classStatistics" => Some(handle_class_statistics(state, req)),
        "calc.previewGrade" => Some(handle_preview_grade(state, req)),
        "reports.studentReport" => Some(handle_student_report(state, req)),
        _ => None,
    }
}
