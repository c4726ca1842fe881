use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            curriculum_type TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    ensure_classes_curriculum_type(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            admission_no TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class_sort ON subjects(class_id, sort_order)",
        [],
    )?;

    // component_scores holds a JSON object: component name -> number | "absent".
    // total_score/label are the last derived snapshot written back by the repository.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_entries(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            exam_type TEXT NOT NULL,
            component_scores TEXT NOT NULL DEFAULT '{}',
            remarks TEXT,
            status TEXT NOT NULL DEFAULT 'draft',
            label_override TEXT,
            total_score REAL,
            label TEXT,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, term, exam_type)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_entries_sheet ON grade_entries(class_id, term, exam_type)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_classes_curriculum_type(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "classes", "curriculum_type")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE classes ADD COLUMN curriculum_type TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("settings value for {} is not valid JSON", key))?;
    Ok(Some(value))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn settings_delete(conn: &Connection, key: &str) -> anyhow::Result<bool> {
    let n = conn.execute("DELETE FROM settings WHERE key = ?", [key])?;
    Ok(n > 0)
}

pub fn boundaries_settings_key(class_id: &str) -> String {
    format!("grading.boundaries.{}", class_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn open_db_is_repeatable_and_settings_roundtrip() {
        let ws = temp_workspace("gradebook-db-open");
        {
            let conn = open_db(&ws).expect("first open");
            settings_set_json(&conn, "k", &json!({ "a": 1 })).expect("set");
        }
        let conn = open_db(&ws).expect("second open");
        assert_eq!(
            settings_get_json(&conn, "k").expect("get"),
            Some(json!({ "a": 1 }))
        );
        assert!(settings_delete(&conn, "k").expect("delete"));
        assert!(!settings_delete(&conn, "k").expect("delete again"));
        assert_eq!(settings_get_json(&conn, "k").expect("get"), None);
        assert!(table_has_column(&conn, "classes", "curriculum_type").expect("pragma"));
    }

    #[test]
    fn legacy_classes_table_gains_curriculum_type() {
        let ws = temp_workspace("gradebook-db-migrate");
        {
            let conn = Connection::open(ws.join(DB_FILE_NAME)).expect("open raw");
            conn.execute("CREATE TABLE classes(id TEXT PRIMARY KEY, name TEXT NOT NULL)", [])
                .expect("legacy table");
            conn.execute("INSERT INTO classes(id, name) VALUES('c1', 'Form 2')", [])
                .expect("legacy row");
        }
        let conn = open_db(&ws).expect("open migrates");
        let token: String = conn
            .query_row("SELECT curriculum_type FROM classes WHERE id = 'c1'", [], |r| r.get(0))
            .expect("row");
        assert_eq!(token, "");
    }
}
