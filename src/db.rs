use crate::grading::{self, GradedRecord};
use anyhow::Context;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

pub const DB_FILE: &str = "gradebook.sqlite3";
pub const SCHEMA_VERSION: i64 = 1;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            first_name TEXT,
            last_name TEXT,
            student_no TEXT,
            department TEXT,
            year TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)", [])?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_department_year ON users(department, year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            subject_code TEXT NOT NULL UNIQUE,
            subject_name TEXT NOT NULL,
            department TEXT NOT NULL,
            year TEXT NOT NULL,
            credits REAL NOT NULL,
            max_marks REAL NOT NULL DEFAULT 100,
            passing_marks REAL NOT NULL DEFAULT 33,
            teacher_id TEXT,
            description TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_department_year ON subjects(department, year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_teacher ON subjects(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            semester TEXT NOT NULL,
            enrolled_at TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, academic_year, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_subject ON enrollments(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            marks REAL NOT NULL,
            grade TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            semester TEXT NOT NULL,
            remarks TEXT,
            graded_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, exam_type, academic_year, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student_subject ON grades(student_id, subject_id, academic_year, semester)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_term ON grades(academic_year, semester)",
        [],
    )?;

    settings_set_json(&conn, "schema.version", &serde_json::json!(SCHEMA_VERSION))?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("setting {} is not valid JSON", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, text),
    )?;
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Filters for reading graded rows. `department`/`year` match the student's
/// profile, not the subject.
#[derive(Debug, Clone, Default)]
pub struct GradeQuery {
    pub student_id: Option<String>,
    pub subject_id: Option<String>,
    pub academic_year: Option<String>,
    pub semester: Option<String>,
    pub exam_type: Option<String>,
    pub department: Option<String>,
    pub year: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub student_no: Option<String>,
    pub subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    pub credits: f64,
    pub max_marks: f64,
    pub marks: f64,
    pub grade: String,
    pub percentage: Option<f64>,
    pub exam_type: String,
    pub academic_year: String,
    pub semester: String,
    pub remarks: Option<String>,
    pub graded_by: String,
    pub updated_at: String,
}

impl GradeRow {
    pub fn to_record(&self) -> GradedRecord {
        GradedRecord::new(self.marks, self.grade.clone())
            .with_credits(self.credits)
            .with_max_marks(self.max_marks)
    }
}

pub fn graded_records(rows: &[GradeRow]) -> Vec<GradedRecord> {
    rows.iter().map(GradeRow::to_record).collect()
}

pub fn fetch_graded_rows(conn: &Connection, q: &GradeQuery) -> anyhow::Result<Vec<GradeRow>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    let mut push = |clause: &'static str, v: &Option<String>| {
        if let Some(v) = v {
            clauses.push(clause);
            binds.push(Value::Text(v.clone()));
        }
    };
    push("g.student_id = ?", &q.student_id);
    push("g.subject_id = ?", &q.subject_id);
    push("g.academic_year = ?", &q.academic_year);
    push("g.semester = ?", &q.semester);
    push("g.exam_type = ?", &q.exam_type);
    push("u.department = ?", &q.department);
    push("u.year = ?", &q.year);

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT g.id, g.student_id,
                COALESCE(u.first_name, ''), COALESCE(u.last_name, ''), u.username, u.student_no,
                g.subject_id, s.subject_code, s.subject_name, s.credits, s.max_marks,
                g.marks, g.grade, g.exam_type, g.academic_year, g.semester,
                g.remarks, g.graded_by, g.updated_at
         FROM grades g
         JOIN users u ON u.id = g.student_id
         JOIN subjects s ON s.id = g.subject_id
         {}
         ORDER BY s.subject_name, u.last_name, u.first_name, g.exam_type",
        where_sql
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            let username: String = r.get(4)?;
            let student_name = match (first.trim(), last.trim()) {
                ("", "") => username,
                (f, "") => f.to_string(),
                ("", l) => l.to_string(),
                (f, l) => format!("{} {}", f, l),
            };
            let credits: f64 = r.get(9)?;
            let max_marks: f64 = r.get(10)?;
            let marks: f64 = r.get(11)?;
            Ok(GradeRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                student_name,
                student_no: r.get(5)?,
                subject_id: r.get(6)?,
                subject_code: r.get(7)?,
                subject_name: r.get(8)?,
                credits,
                max_marks,
                marks,
                grade: r.get(12)?,
                percentage: grading::percentage(marks, max_marks).ok(),
                exam_type: r.get(13)?,
                academic_year: r.get(14)?,
                semester: r.get(15)?,
                remarks: r.get(16)?,
                graded_by: r.get(17)?,
                updated_at: r.get(18)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct SubjectScale {
    pub credits: f64,
    pub max_marks: f64,
}

pub fn subject_scale(conn: &Connection, subject_id: &str) -> anyhow::Result<Option<SubjectScale>> {
    Ok(conn
        .query_row(
            "SELECT credits, max_marks FROM subjects WHERE id = ?",
            [subject_id],
            |r| {
                Ok(SubjectScale {
                    credits: r.get(0)?,
                    max_marks: r.get(1)?,
                })
            },
        )
        .optional()?)
}

pub fn user_role(conn: &Connection, user_id: &str) -> anyhow::Result<Option<String>> {
    Ok(conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()?)
}

pub fn is_enrolled(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    academic_year: &str,
    semester: &str,
) -> anyhow::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments
             WHERE student_id = ? AND subject_id = ? AND academic_year = ? AND semester = ?
               AND active = 1",
            (student_id, subject_id, academic_year, semester),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

#[derive(Debug, Clone)]
pub struct GradeWrite<'a> {
    pub student_id: &'a str,
    pub subject_id: &'a str,
    pub marks: f64,
    pub grade: &'a str,
    pub exam_type: &'a str,
    pub academic_year: &'a str,
    pub semester: &'a str,
    pub remarks: Option<&'a str>,
    pub graded_by: &'a str,
}

/// Insert or overwrite the grade for (student, subject, exam, year, semester).
/// Returns the row id and whether it was newly created.
pub fn upsert_grade(conn: &Connection, w: &GradeWrite<'_>) -> anyhow::Result<(String, bool)> {
    let now = now_rfc3339();
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM grades
             WHERE student_id = ? AND subject_id = ? AND exam_type = ?
               AND academic_year = ? AND semester = ?",
            (
                w.student_id,
                w.subject_id,
                w.exam_type,
                w.academic_year,
                w.semester,
            ),
            |r| r.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE grades
             SET marks = ?, grade = ?, remarks = ?, graded_by = ?, updated_at = ?
             WHERE id = ?",
            (w.marks, w.grade, w.remarks, w.graded_by, &now, &id),
        )
        .context("failed to update grade")?;
        return Ok((id, false));
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(
            id, student_id, subject_id, marks, grade, exam_type,
            academic_year, semester, remarks, graded_by, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            w.student_id,
            w.subject_id,
            w.marks,
            w.grade,
            w.exam_type,
            w.academic_year,
            w.semester,
            w.remarks,
            w.graded_by,
            &now,
            &now
        ],
    )
    .context("failed to insert grade")?;
    Ok((id, true))
}

/// Re-derive every stored grade of a subject against a new scale.
pub fn regrade_subject(conn: &Connection, subject_id: &str, max_marks: f64) -> anyhow::Result<usize> {
    let mut stmt = conn.prepare("SELECT id, marks FROM grades WHERE subject_id = ?")?;
    let rows = stmt
        .query_map([subject_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let now = now_rfc3339();
    for (id, marks) in &rows {
        let grade = grading::classify(*marks, max_marks)?;
        conn.execute(
            "UPDATE grades SET grade = ?, updated_at = ? WHERE id = ?",
            (grade.as_str(), &now, id),
        )?;
    }
    Ok(rows.len())
}
