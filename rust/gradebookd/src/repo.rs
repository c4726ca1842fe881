use crate::calc::{ComponentScores, DerivedGrade, EntryStatus, RawScoreEntry};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

/// Identifies one cell of a grading sheet.
#[derive(Debug, Clone, Copy)]
pub struct EntryKey<'a> {
    pub class_id: &'a str,
    pub student_id: &'a str,
    pub subject_id: &'a str,
    pub term: i64,
    pub exam_type: &'a str,
}

/// A raw entry plus the workflow fields the calculator never reads.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub raw: RawScoreEntry,
    pub status: EntryStatus,
    pub label_override: Option<String>,
    pub updated_at: Option<String>,
}

impl StoredEntry {
    pub fn blank(student_id: &str, subject_id: &str) -> Self {
        Self {
            raw: RawScoreEntry {
                student_id: student_id.to_string(),
                subject_id: subject_id.to_string(),
                component_scores: ComponentScores::new(),
                remarks: None,
            },
            status: EntryStatus::Draft,
            label_override: None,
            updated_at: None,
        }
    }
}

/// Storage seam for raw and derived grades. The calculator never sees it; the
/// IPC layer reads entries through it and hands derived grades back.
pub trait GradeRepository {
    fn load_entries(
        &self,
        class_id: &str,
        term: i64,
        exam_type: &str,
    ) -> anyhow::Result<Vec<StoredEntry>>;

    fn load_entry(&self, key: &EntryKey<'_>) -> anyhow::Result<Option<StoredEntry>>;

    /// Fire-and-forget: callers do not wait on or react to a failed write.
    fn on_grade_change(&self, key: &EntryKey<'_>, grade: &DerivedGrade);
}

pub struct SqliteGradeRepository<'a> {
    conn: &'a Connection,
}

const ENTRY_COLUMNS: &str =
    "student_id, subject_id, component_scores, remarks, status, label_override, updated_at";

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn read_entry(r: &Row<'_>) -> rusqlite::Result<(StoredEntry, String, String)> {
    let scores_json: String = r.get(2)?;
    let status: String = r.get(4)?;
    Ok((
        StoredEntry {
            raw: RawScoreEntry {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                component_scores: ComponentScores::new(),
                remarks: r.get(3)?,
            },
            status: EntryStatus::Draft,
            label_override: r.get(5)?,
            updated_at: r.get(6)?,
        },
        scores_json,
        status,
    ))
}

fn finish_entry(
    (mut entry, scores_json, status): (StoredEntry, String, String),
) -> anyhow::Result<StoredEntry> {
    entry.raw.component_scores = serde_json::from_str(&scores_json).with_context(|| {
        format!(
            "component_scores for student {} subject {} is not valid",
            entry.raw.student_id, entry.raw.subject_id
        )
    })?;
    // Unknown statuses are written by the approval workflow, never by us; treat
    // them as non-draft so they stay locked.
    entry.status = EntryStatus::parse(&status).unwrap_or(EntryStatus::Submitted);
    Ok(entry)
}

impl<'a> SqliteGradeRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn ensure_entry(&self, key: &EntryKey<'_>) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO grade_entries(id, class_id, student_id, subject_id, term, exam_type, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(student_id, subject_id, term, exam_type) DO NOTHING",
                (
                    Uuid::new_v4().to_string(),
                    key.class_id,
                    key.student_id,
                    key.subject_id,
                    key.term,
                    key.exam_type,
                    now_rfc3339(),
                ),
            )
            .context("failed to create grade entry")?;
        Ok(())
    }

    /// Stores new component scores and drops any label override, since the
    /// override was made against the previous total.
    pub fn save_components(
        &self,
        key: &EntryKey<'_>,
        scores: &ComponentScores,
    ) -> anyhow::Result<()> {
        self.ensure_entry(key)?;
        self.conn
            .execute(
                "UPDATE grade_entries
                 SET component_scores = ?, label_override = NULL, updated_at = ?
                 WHERE student_id = ? AND subject_id = ? AND term = ? AND exam_type = ?",
                (
                    serde_json::to_string(scores)?,
                    now_rfc3339(),
                    key.student_id,
                    key.subject_id,
                    key.term,
                    key.exam_type,
                ),
            )
            .context("failed to update component scores")?;
        Ok(())
    }

    pub fn save_remarks(&self, key: &EntryKey<'_>, remarks: Option<&str>) -> anyhow::Result<()> {
        self.ensure_entry(key)?;
        self.conn
            .execute(
                "UPDATE grade_entries SET remarks = ?, updated_at = ?
                 WHERE student_id = ? AND subject_id = ? AND term = ? AND exam_type = ?",
                (
                    remarks,
                    now_rfc3339(),
                    key.student_id,
                    key.subject_id,
                    key.term,
                    key.exam_type,
                ),
            )
            .context("failed to update remarks")?;
        Ok(())
    }

    pub fn save_label_override(
        &self,
        key: &EntryKey<'_>,
        label: Option<&str>,
    ) -> anyhow::Result<()> {
        self.ensure_entry(key)?;
        self.conn
            .execute(
                "UPDATE grade_entries SET label_override = ?, updated_at = ?
                 WHERE student_id = ? AND subject_id = ? AND term = ? AND exam_type = ?",
                (
                    label,
                    now_rfc3339(),
                    key.student_id,
                    key.subject_id,
                    key.term,
                    key.exam_type,
                ),
            )
            .context("failed to update label override")?;
        Ok(())
    }

    pub fn save_status(&self, key: &EntryKey<'_>, status: EntryStatus) -> anyhow::Result<()> {
        self.ensure_entry(key)?;
        self.conn
            .execute(
                "UPDATE grade_entries SET status = ?, updated_at = ?
                 WHERE student_id = ? AND subject_id = ? AND term = ? AND exam_type = ?",
                (
                    status.as_str(),
                    now_rfc3339(),
                    key.student_id,
                    key.subject_id,
                    key.term,
                    key.exam_type,
                ),
            )
            .context("failed to update status")?;
        Ok(())
    }

    fn write_derived(&self, key: &EntryKey<'_>, grade: &DerivedGrade) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE grade_entries SET total_score = ?, label = ?
             WHERE student_id = ? AND subject_id = ? AND term = ? AND exam_type = ?",
            (
                grade.total_score,
                grade.label.as_deref(),
                key.student_id,
                key.subject_id,
                key.term,
                key.exam_type,
            ),
        )?;
        Ok(())
    }
}

impl GradeRepository for SqliteGradeRepository<'_> {
    fn load_entries(
        &self,
        class_id: &str,
        term: i64,
        exam_type: &str,
    ) -> anyhow::Result<Vec<StoredEntry>> {
        let sql = format!(
            "SELECT {} FROM grade_entries WHERE class_id = ? AND term = ? AND exam_type = ?",
            ENTRY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map((class_id, term, exam_type), read_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(finish_entry).collect()
    }

    fn load_entry(&self, key: &EntryKey<'_>) -> anyhow::Result<Option<StoredEntry>> {
        let sql = format!(
            "SELECT {} FROM grade_entries
             WHERE student_id = ? AND subject_id = ? AND term = ? AND exam_type = ?",
            ENTRY_COLUMNS
        );
        let raw = self
            .conn
            .query_row(
                &sql,
                (key.student_id, key.subject_id, key.term, key.exam_type),
                read_entry,
            )
            .optional()?;
        raw.map(finish_entry).transpose()
    }

    fn on_grade_change(&self, key: &EntryKey<'_>, grade: &DerivedGrade) {
        if let Err(e) = self.write_derived(key, grade) {
            tracing::warn!(
                student_id = key.student_id,
                subject_id = key.subject_id,
                error = %e,
                "failed to store derived grade"
            );
        }
    }
}
