use crate::calc::{self, ClassStatistics, ComponentScores, DerivedGrade, EntryStatus};
use crate::curriculum::{resolve_profile, CurriculumId, CurriculumProfile, GradeBoundary};
use crate::db;
use crate::repo::{GradeRepository, SqliteGradeRepository, StoredEntry};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct SheetError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl SheetError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn query(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: String,
    pub name: String,
    pub curriculum_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveProfile {
    pub curriculum_type: String,
    pub has_override: bool,
    pub profile: CurriculumProfile,
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassInfo, SheetError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT name, curriculum_type FROM classes WHERE id = ?",
            [class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(SheetError::query)?;
    let Some((name, curriculum_type)) = row else {
        return Err(SheetError::new("not_found", "class not found")
            .with_details(json!({ "classId": class_id })));
    };
    Ok(ClassInfo {
        id: class_id.to_string(),
        name,
        curriculum_type,
    })
}

/// The class's resolved profile with any stored boundary override applied.
/// A stored override that no longer validates is ignored.
pub fn effective_profile(
    conn: &Connection,
    class: &ClassInfo,
) -> Result<EffectiveProfile, SheetError> {
    let token = class.curriculum_type.trim();
    if !token.is_empty() && CurriculumId::from_token(token).is_none() {
        tracing::warn!(
            class_id = %class.id,
            curriculum_type = %class.curriculum_type,
            "unrecognized curriculum type, grading as STANDARD"
        );
    }
    let base = resolve_profile(&class.curriculum_type);

    let stored = db::settings_get_json(conn, &db::boundaries_settings_key(&class.id))
        .map_err(SheetError::query)?;
    let Some(stored) = stored else {
        return Ok(EffectiveProfile {
            curriculum_type: class.curriculum_type.clone(),
            has_override: false,
            profile: base,
        });
    };

    let parsed = serde_json::from_value::<Vec<GradeBoundary>>(stored)
        .map_err(|e| e.to_string())
        .and_then(|table| base.with_boundaries(table).map_err(|e| e.to_string()));
    match parsed {
        Ok(profile) => Ok(EffectiveProfile {
            curriculum_type: class.curriculum_type.clone(),
            has_override: true,
            profile,
        }),
        Err(e) => {
            tracing::warn!(class_id = %class.id, error = %e, "ignoring stored boundary override");
            Ok(EffectiveProfile {
                curriculum_type: class.curriculum_type.clone(),
                has_override: false,
                profile: base,
            })
        }
    }
}

/// Derives the grade for a stored entry, applying its label override when the
/// override is still a member of the profile's label set.
pub fn derive_stored(entry: &StoredEntry, profile: &CurriculumProfile) -> DerivedGrade {
    let grade = calc::derive_grade(&entry.raw.component_scores, profile);
    let Some(label) = entry.label_override.as_deref() else {
        return grade;
    };
    if grade.total_score.is_none() {
        return grade;
    }
    match calc::set_label_override(&grade, label, profile) {
        Ok(overridden) => overridden,
        Err(e) => {
            tracing::warn!(
                student_id = %entry.raw.student_id,
                subject_id = %entry.raw.subject_id,
                error = %e,
                "dropping stale label override"
            );
            grade
        }
    }
}

#[derive(Debug, Clone)]
pub struct SheetScope {
    pub class_id: String,
    pub term: i64,
    pub exam_type: String,
    pub subject_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSubject {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetCell {
    pub subject_id: String,
    pub component_scores: ComponentScores,
    pub remarks: Option<String>,
    pub status: EntryStatus,
    pub locked: bool,
    #[serde(flatten)]
    pub grade: DerivedGrade,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetRow {
    pub student_id: String,
    pub display_name: String,
    pub grades: Vec<SheetCell>,
    pub aggregate_score: f64,
    pub mean_score: Option<f64>,
    pub position: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetModel {
    pub class: ClassInfo,
    pub profile: CurriculumProfile,
    pub has_boundary_override: bool,
    pub term: i64,
    pub exam_type: String,
    pub subjects: Vec<SheetSubject>,
    pub rows: Vec<SheetRow>,
    pub statistics: ClassStatistics,
}

struct SheetStudent {
    id: String,
    display_name: String,
}

fn load_students(conn: &Connection, class_id: &str) -> Result<Vec<SheetStudent>, SheetError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name
             FROM students
             WHERE class_id = ? AND active = 1
             ORDER BY sort_order",
        )
        .map_err(SheetError::query)?;
    let students = stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(SheetStudent {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(SheetError::query)?;
    Ok(students)
}

fn load_subjects(
    conn: &Connection,
    class_id: &str,
    only: Option<&[String]>,
) -> Result<Vec<SheetSubject>, SheetError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, code
             FROM subjects
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(SheetError::query)?;
    let all: Vec<SheetSubject> = stmt
        .query_map([class_id], |r| {
            Ok(SheetSubject {
                id: r.get(0)?,
                name: r.get(1)?,
                code: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(SheetError::query)?;

    let Some(only) = only else {
        return Ok(all);
    };
    let unknown: Vec<&String> = only
        .iter()
        .filter(|id| !all.iter().any(|s| s.id == **id))
        .collect();
    if !unknown.is_empty() {
        return Err(SheetError::new("not_found", "subject not found in class")
            .with_details(json!({ "subjectIds": unknown })));
    }
    Ok(all.into_iter().filter(|s| only.contains(&s.id)).collect())
}

pub fn build_sheet(
    conn: &Connection,
    scope: &SheetScope,
    read_only: bool,
) -> Result<SheetModel, SheetError> {
    let class = load_class(conn, &scope.class_id)?;
    let effective = effective_profile(conn, &class)?;
    let profile = effective.profile;

    let students = load_students(conn, &class.id)?;
    let subjects = load_subjects(conn, &class.id, scope.subject_ids.as_deref())?;

    let repo = SqliteGradeRepository::new(conn);
    let entries = repo
        .load_entries(&class.id, scope.term, &scope.exam_type)
        .map_err(SheetError::query)?;
    let mut by_pair: HashMap<(String, String), StoredEntry> = HashMap::new();
    for e in entries {
        by_pair.insert((e.raw.student_id.clone(), e.raw.subject_id.clone()), e);
    }

    let mut rows: Vec<SheetRow> = Vec::with_capacity(students.len());
    let mut grade_rows: Vec<Vec<DerivedGrade>> = Vec::with_capacity(students.len());
    for s in &students {
        let mut cells: Vec<SheetCell> = Vec::with_capacity(subjects.len());
        for subj in &subjects {
            let entry = by_pair
                .remove(&(s.id.clone(), subj.id.clone()))
                .unwrap_or_else(|| StoredEntry::blank(&s.id, &subj.id));
            let grade = derive_stored(&entry, &profile);
            cells.push(SheetCell {
                subject_id: subj.id.clone(),
                locked: calc::is_locked(entry.status, read_only),
                status: entry.status,
                component_scores: entry.raw.component_scores,
                remarks: entry.raw.remarks,
                grade,
            });
        }
        grade_rows.push(cells.iter().map(|c| c.grade.clone()).collect());
        rows.push(SheetRow {
            student_id: s.id.clone(),
            display_name: s.display_name.clone(),
            grades: cells,
            aggregate_score: 0.0,
            mean_score: None,
            position: None,
        });
    }

    let statistics = calc::aggregate(&grade_rows, &profile);
    for (row, standing) in rows.iter_mut().zip(statistics.standings.iter()) {
        row.aggregate_score = standing.aggregate_score;
        row.mean_score = standing.mean_score;
        row.position = standing.position;
    }

    Ok(SheetModel {
        class,
        profile,
        has_boundary_override: effective.has_override,
        term: scope.term,
        exam_type: scope.exam_type.clone(),
        subjects,
        rows,
        statistics,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportLine {
    pub subject_id: String,
    pub subject_name: String,
    pub total_score: Option<f64>,
    pub label: Option<String>,
    pub absent: bool,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub class: ClassInfo,
    pub curriculum: CurriculumId,
    pub term: i64,
    pub exam_type: String,
    pub student_id: String,
    pub display_name: String,
    pub lines: Vec<ReportLine>,
    pub aggregate_score: f64,
    pub mean_score: Option<f64>,
    pub mean_label: Option<String>,
    pub position: Option<u32>,
    pub class_size: usize,
}

pub fn build_student_report(
    conn: &Connection,
    scope: &SheetScope,
    student_id: &str,
) -> Result<StudentReport, SheetError> {
    let sheet = build_sheet(conn, scope, true)?;
    let class_size = sheet.rows.len();
    let Some(row) = sheet.rows.into_iter().find(|r| r.student_id == student_id) else {
        return Err(SheetError::new("not_found", "student not found in class")
            .with_details(json!({ "studentId": student_id })));
    };

    let lines = row
        .grades
        .into_iter()
        .zip(sheet.subjects.iter())
        .map(|(cell, subj)| ReportLine {
            subject_id: cell.subject_id,
            subject_name: subj.name.clone(),
            total_score: cell.grade.total_score,
            label: cell.grade.label,
            absent: cell.grade.absent,
            remarks: cell.remarks,
        })
        .collect();
    let mean_label = row
        .mean_score
        .and_then(|m| calc::compute_label(m, &sheet.profile))
        .map(str::to_string);

    Ok(StudentReport {
        class: sheet.class,
        curriculum: sheet.profile.id,
        term: sheet.term,
        exam_type: sheet.exam_type,
        student_id: row.student_id,
        display_name: row.display_name,
        lines,
        aggregate_score: row.aggregate_score,
        mean_score: row.mean_score,
        mean_label,
        position: row.position,
        class_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn seeded(curriculum: &str) -> Connection {
        let ws = std::env::temp_dir().join(format!("gradebook-sheet-{}", Uuid::new_v4()));
        let conn = db::open_db(&ws).expect("open db");
        conn.execute(
            "INSERT INTO classes(id, name, curriculum_type) VALUES('c1', 'Form 3', ?)",
            [curriculum],
        )
        .expect("class");
        conn.execute_batch(
            "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
               VALUES('s1', 'c1', 'Kamau', 'Brian', 1, 0),
                     ('s2', 'c1', 'Wanjiru', 'Faith', 1, 1),
                     ('s3', 'c1', 'Mwangi', 'Peter', 0, 2);
             INSERT INTO subjects(id, class_id, name, code, sort_order)
               VALUES('m1', 'c1', 'Mathematics', 'MAT', 0),
                     ('m2', 'c1', 'English', 'ENG', 1);",
        )
        .expect("roster");
        conn
    }

    fn put(conn: &Connection, student: &str, subject: &str, scores: &str, status: &str) {
        conn.execute(
            "INSERT INTO grade_entries(id, class_id, student_id, subject_id, term, exam_type, component_scores, status)
             VALUES(?, 'c1', ?, ?, 1, 'endterm', ?, ?)",
            (Uuid::new_v4().to_string(), student, subject, scores, status),
        )
        .expect("entry");
    }

    fn scope() -> SheetScope {
        SheetScope {
            class_id: "c1".to_string(),
            term: 1,
            exam_type: "endterm".to_string(),
            subject_ids: None,
        }
    }

    #[test]
    fn sheet_ranks_standard_class_and_skips_inactive_students() {
        let conn = seeded("8-4-4");
        put(&conn, "s1", "m1", r#"{"score": 80}"#, "draft");
        put(&conn, "s1", "m2", r#"{"score": 60}"#, "approved");
        put(&conn, "s2", "m1", r#"{"score": 90}"#, "draft");
        put(&conn, "s2", "m2", r#"{"score": 72}"#, "draft");
        put(&conn, "s3", "m1", r#"{"score": 99}"#, "draft");

        let sheet = build_sheet(&conn, &scope(), false).expect("sheet");
        assert_eq!(sheet.profile.id, CurriculumId::Standard);
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[0].display_name, "Kamau, Brian");
        assert_eq!(sheet.rows[0].aggregate_score, 140.0);
        assert_eq!(sheet.rows[0].position, Some(2));
        assert_eq!(sheet.rows[1].position, Some(1));
        assert!(!sheet.rows[0].grades[0].locked);
        assert!(sheet.rows[0].grades[1].locked);
        assert_eq!(sheet.rows[0].grades[1].grade.label.as_deref(), Some("B-"));
        assert_eq!(sheet.statistics.completion_rate, 100.0);

        let read_only = build_sheet(&conn, &scope(), true).expect("sheet");
        assert!(read_only.rows[0].grades[0].locked);
    }

    #[test]
    fn stored_override_survives_only_while_valid() {
        let conn = seeded("IGCSE");
        put(&conn, "s1", "m1", r#"{"coursework": 90, "exam": 85}"#, "draft");
        conn.execute("UPDATE grade_entries SET label_override = 'A*'", [])
            .expect("override");
        let sheet = build_sheet(&conn, &scope(), false).expect("sheet");
        let cell = &sheet.rows[0].grades[0];
        assert_eq!(cell.grade.total_score, Some(87.0));
        assert_eq!(cell.grade.label.as_deref(), Some("A*"));
        assert!(cell.grade.label_overridden);

        conn.execute("UPDATE grade_entries SET label_override = 'A+'", [])
            .expect("stale override");
        let sheet = build_sheet(&conn, &scope(), false).expect("sheet");
        assert_eq!(sheet.rows[0].grades[0].grade.label.as_deref(), Some("A"));
    }

    #[test]
    fn invalid_stored_boundaries_fall_back_to_builtin() {
        let conn = seeded("igcse");
        let class = load_class(&conn, "c1").expect("class");
        db::settings_set_json(
            &conn,
            &db::boundaries_settings_key("c1"),
            &json!([{ "label": "A", "minPercent": 50.0 }]),
        )
        .expect("settings");
        let eff = effective_profile(&conn, &class).expect("profile");
        assert!(!eff.has_override);
        assert_eq!(eff.profile.boundaries.len(), 9);

        db::settings_set_json(
            &conn,
            &db::boundaries_settings_key("c1"),
            &json!([{ "label": "A", "minPercent": 50.0 }, { "label": "U", "minPercent": 0.0 }]),
        )
        .expect("settings");
        let eff = effective_profile(&conn, &class).expect("profile");
        assert!(eff.has_override);
        assert!(eff.profile.custom_boundaries);
    }

    #[test]
    fn student_report_carries_position_and_mean_label() {
        let conn = seeded("standard");
        put(&conn, "s1", "m1", r#"{"score": 80}"#, "draft");
        put(&conn, "s1", "m2", r#"{"score": 70}"#, "draft");
        put(&conn, "s2", "m1", r#"{"score": "absent"}"#, "draft");

        let report = build_student_report(&conn, &scope(), "s1").expect("report");
        assert_eq!(report.class_size, 2);
        assert_eq!(report.position, Some(1));
        assert_eq!(report.mean_score, Some(75.0));
        assert_eq!(report.mean_label.as_deref(), Some("A-"));
        assert_eq!(report.lines[0].subject_name, "Mathematics");

        let other = build_student_report(&conn, &scope(), "s2").expect("report");
        assert!(other.lines[0].absent);
        assert_eq!(other.position, Some(0));

        let missing = build_student_report(&conn, &scope(), "nobody").unwrap_err();
        assert_eq!(missing.code, "not_found");
    }

    #[test]
    fn unknown_subject_filter_is_rejected() {
        let conn = seeded("CBC");
        let mut sc = scope();
        sc.subject_ids = Some(vec!["m2".to_string(), "zz".to_string()]);
        let e = build_sheet(&conn, &sc, false).unwrap_err();
        assert_eq!(e.code, "not_found");

        sc.subject_ids = Some(vec!["m2".to_string()]);
        let sheet = build_sheet(&conn, &sc, false).expect("sheet");
        assert_eq!(sheet.subjects.len(), 1);
        assert_eq!(sheet.statistics.completion_rate, 0.0);
        assert!(sheet.rows.iter().all(|r| r.position.is_none()));
    }
}
