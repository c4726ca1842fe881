use crate::calc::{self, ComponentScore, DerivedGrade, EntryStatus, ABSENT_TOKEN};
use crate::curriculum::CurriculumProfile;
use crate::ipc::error::ok;
use crate::ipc::helpers::{db_conn, flag, parse_sheet_scope, sheet_err};
use crate::ipc::types::{AppState, Request};
use crate::repo::{EntryKey, GradeRepository, SqliteGradeRepository, StoredEntry};
use crate::sheet::{self, SheetCell, SheetError};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct CellTarget {
    class_id: String,
    student_id: String,
    subject_id: String,
    term: i64,
    exam_type: String,
}

impl CellTarget {
    fn key(&self) -> EntryKey<'_> {
        EntryKey {
            class_id: &self.class_id,
            student_id: &self.student_id,
            subject_id: &self.subject_id,
            term: self.term,
            exam_type: &self.exam_type,
        }
    }
}

fn str_param(req: &Request, key: &str) -> Result<String, SheetError> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| SheetError::new("bad_params", format!("missing {}", key)))
}

fn parse_cell_target(req: &Request) -> Result<CellTarget, SheetError> {
    let term = req
        .params
        .get("term")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| SheetError::new("bad_params", "missing term"))?;
    Ok(CellTarget {
        class_id: str_param(req, "classId")?,
        student_id: str_param(req, "studentId")?,
        subject_id: str_param(req, "subjectId")?,
        term,
        exam_type: str_param(req, "examType")?,
    })
}

/// Session flags that make every entry read-only for this call.
fn read_only_session(req: &Request) -> bool {
    flag(req, "isReadOnly") || flag(req, "isViewOnly")
}

fn belongs_to_class(
    conn: &Connection,
    table: &str,
    id: &str,
    class_id: &str,
) -> Result<bool, SheetError> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ? AND class_id = ?", table);
    let found: Option<i64> = conn
        .query_row(&sql, (id, class_id), |r| r.get(0))
        .optional()
        .map_err(|e| SheetError::new("db_query_failed", e.to_string()))?;
    Ok(found.is_some())
}

/// Resolves the class profile and the current stored entry for one cell,
/// checking that the student and subject belong to the class.
fn load_cell(
    conn: &Connection,
    target: &CellTarget,
) -> Result<(CurriculumProfile, StoredEntry), SheetError> {
    let class = sheet::load_class(conn, &target.class_id)?;
    if !belongs_to_class(conn, "students", &target.student_id, &class.id)? {
        return Err(SheetError::new("not_found", "student not found in class")
            .with_details(json!({ "studentId": target.student_id })));
    }
    if !belongs_to_class(conn, "subjects", &target.subject_id, &class.id)? {
        return Err(SheetError::new("not_found", "subject not found in class")
            .with_details(json!({ "subjectId": target.subject_id })));
    }
    let profile = sheet::effective_profile(conn, &class)?.profile;

    let repo = SqliteGradeRepository::new(conn);
    let entry = repo
        .load_entry(&target.key())
        .map_err(|e| SheetError::new("db_query_failed", e.to_string()))?
        .unwrap_or_else(|| StoredEntry::blank(&target.student_id, &target.subject_id));
    Ok((profile, entry))
}

fn check_unlocked(entry: &StoredEntry, read_only: bool) -> Result<(), SheetError> {
    if calc::is_locked(entry.status, read_only) {
        return Err(
            SheetError::new("locked", "grade entry is locked for editing").with_details(json!({
                "status": entry.status,
                "readOnly": read_only
            })),
        );
    }
    Ok(())
}

fn write_failed(e: anyhow::Error) -> SheetError {
    SheetError::new("db_update_failed", e.to_string())
        .with_details(json!({ "table": "grade_entries" }))
}

fn cell_response(
    target: &CellTarget,
    entry: StoredEntry,
    grade: DerivedGrade,
    read_only: bool,
) -> serde_json::Value {
    let cell = SheetCell {
        subject_id: entry.raw.subject_id,
        locked: calc::is_locked(entry.status, read_only),
        status: entry.status,
        component_scores: entry.raw.component_scores,
        remarks: entry.raw.remarks,
        grade,
    };
    let mut out = json!(cell);
    out["studentId"] = json!(target.student_id);
    out["term"] = json!(target.term);
    out["examType"] = json!(target.exam_type);
    out
}

fn parse_component_value(req: &Request) -> Result<Option<ComponentScore>, SheetError> {
    if flag(req, "clear") {
        return Ok(None);
    }
    if flag(req, "absent") {
        return Ok(Some(ComponentScore::Absent));
    }
    let Some(v) = req.params.get("value") else {
        return Err(SheetError::new(
            "bad_params",
            "missing value (or absent/clear)",
        ));
    };
    if v.is_null() {
        return Ok(None);
    }
    if let Some(n) = v.as_f64() {
        return Ok(Some(ComponentScore::Scored(n)));
    }
    if v
        .as_str()
        .map(|s| s.trim().eq_ignore_ascii_case(ABSENT_TOKEN))
        .unwrap_or(false)
    {
        return Ok(Some(ComponentScore::Absent));
    }
    Err(
        SheetError::new("bad_params", "value must be a number, \"absent\", or null")
            .with_details(json!({ "value": v })),
    )
}

fn set_component(conn: &Connection, req: &Request) -> Result<serde_json::Value, SheetError> {
    let target = parse_cell_target(req)?;
    let component = str_param(req, "component")?;
    let read_only = read_only_session(req);

    let (profile, mut entry) = load_cell(conn, &target)?;
    if profile.component(&component).is_none() {
        let allowed: Vec<&str> = profile.components.iter().map(|c| c.name.as_str()).collect();
        return Err(
            SheetError::new("bad_params", "unknown score component").with_details(json!({
                "component": component,
                "curriculum": profile.id,
                "allowed": allowed
            })),
        );
    }
    check_unlocked(&entry, read_only)?;
    let value = parse_component_value(req)?;

    match value {
        Some(v) => {
            entry.raw.component_scores.insert(component.clone(), v);
        }
        None => {
            entry.raw.component_scores.remove(&component);
        }
    }

    let repo = SqliteGradeRepository::new(conn);
    repo.save_components(&target.key(), &entry.raw.component_scores)
        .map_err(write_failed)?;
    entry.label_override = None;

    let grade = sheet::derive_stored(&entry, &profile);
    repo.on_grade_change(&target.key(), &grade);
    tracing::debug!(
        student_id = %target.student_id,
        subject_id = %target.subject_id,
        component = %component,
        total = ?grade.total_score,
        "component score stored"
    );

    Ok(cell_response(&target, entry, grade, read_only))
}

fn set_remarks(conn: &Connection, req: &Request) -> Result<serde_json::Value, SheetError> {
    let target = parse_cell_target(req)?;
    let read_only = read_only_session(req);
    let remarks = match req.params.get("remarks") {
        None => return Err(SheetError::new("bad_params", "missing remarks")),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            None => {
                return Err(SheetError::new(
                    "bad_params",
                    "remarks must be a string or null",
                ))
            }
        },
    };

    let (profile, mut entry) = load_cell(conn, &target)?;
    check_unlocked(&entry, read_only)?;

    let repo = SqliteGradeRepository::new(conn);
    repo.save_remarks(&target.key(), remarks.as_deref())
        .map_err(write_failed)?;
    entry.raw.remarks = remarks;

    let grade = sheet::derive_stored(&entry, &profile);
    Ok(cell_response(&target, entry, grade, read_only))
}

fn override_label(conn: &Connection, req: &Request) -> Result<serde_json::Value, SheetError> {
    let target = parse_cell_target(req)?;
    if !flag(req, "isPrincipal") {
        return Err(SheetError::new(
            "forbidden",
            "only a principal may override a grade label",
        ));
    }
    if read_only_session(req) {
        return Err(SheetError::new("locked", "read-only session")
            .with_details(json!({ "readOnly": true })));
    }
    let label = match req.params.get("label") {
        None => return Err(SheetError::new("bad_params", "missing label")),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.trim().to_string()),
            None => {
                return Err(SheetError::new(
                    "bad_params",
                    "label must be a string or null",
                ))
            }
        },
    };

    let (profile, mut entry) = load_cell(conn, &target)?;
    if !profile.allows_label_override {
        return Err(
            SheetError::new("forbidden", "this curriculum does not allow label overrides")
                .with_details(json!({ "curriculum": profile.id })),
        );
    }

    let computed = calc::derive_grade(&entry.raw.component_scores, &profile);
    let repo = SqliteGradeRepository::new(conn);
    let grade = match label.as_deref() {
        Some(label) => {
            if computed.total_score.is_none() {
                return Err(SheetError::new(
                    "incomplete",
                    "grade has no total score to override",
                )
                .with_details(json!({ "absent": computed.absent })));
            }
            let overridden = calc::set_label_override(&computed, label, &profile).map_err(|e| {
                SheetError::new("invalid_label", e.to_string()).with_details(json!({
                    "label": e.label,
                    "curriculum": e.curriculum,
                    "labels": profile.labels
                }))
            })?;
            repo.save_label_override(&target.key(), Some(label))
                .map_err(write_failed)?;
            tracing::info!(
                student_id = %target.student_id,
                subject_id = %target.subject_id,
                label = %label,
                computed = ?computed.label,
                "grade label overridden"
            );
            overridden
        }
        None => {
            repo.save_label_override(&target.key(), None)
                .map_err(write_failed)?;
            computed
        }
    };
    entry.label_override = label;
    repo.on_grade_change(&target.key(), &grade);

    Ok(cell_response(&target, entry, grade, false))
}

fn set_status(conn: &Connection, req: &Request) -> Result<serde_json::Value, SheetError> {
    let target = parse_cell_target(req)?;
    let raw = str_param(req, "status")?;
    let Some(status) = EntryStatus::parse(&raw) else {
        return Err(SheetError::new(
            "bad_params",
            "status must be one of: draft, submitted, approved, rejected",
        )
        .with_details(json!({ "status": raw })));
    };

    let (profile, mut entry) = load_cell(conn, &target)?;
    let repo = SqliteGradeRepository::new(conn);
    repo.save_status(&target.key(), status)
        .map_err(write_failed)?;
    entry.status = status;

    let grade = sheet::derive_stored(&entry, &profile);
    repo.on_grade_change(&target.key(), &grade);
    Ok(cell_response(&target, entry, grade, false))
}

fn handle_grades_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scope = match parse_sheet_scope(req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    match sheet::build_sheet(conn, &scope, read_only_session(req)) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => sheet_err(req, e),
    }
}

fn handle_write(
    state: &mut AppState,
    req: &Request,
    op: fn(&Connection, &Request) -> Result<serde_json::Value, SheetError>,
) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match op(conn, req) {
        Ok(v) => ok(&req.id, v),
        Err(e) => sheet_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.sheet" => Some(handle_grades_sheet(state, req)),
        "grades.setComponent" => Some(handle_write(state, req, set_component)),
        "grades.setRemarks" => Some(handle_write(state, req, set_remarks)),
        "grades.overrideLabel" => Some(handle_write(state, req, override_label)),
        "grades.setStatus" => Some(handle_write(state, req, set_status)),
        _ => None,
    }
}
