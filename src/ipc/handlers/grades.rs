use crate::db::{self, GradeWrite};
use crate::grading::{self, GradingError, DEFAULT_MAX_MARKS};
use crate::ipc::error::{err, grading_err, ok};
use crate::ipc::helpers::{
    db_conn, grade_query, optional_f64, parse_actor, require_role, required_f64, required_str,
    Actor, Role, EXAM_TYPES,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::{debug, info, warn};

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn to_json(&self) -> serde_json::Value {
        let mut v = json!({ "code": self.code, "message": self.message });
        if let Some(d) = &self.details {
            v["details"] = d.clone();
        }
        v
    }
}

impl From<GradingError> for HandlerErr {
    fn from(e: GradingError) -> Self {
        HandlerErr::new(e.code(), e.to_string())
    }
}

#[derive(Debug, Clone)]
struct GradeEntry {
    student_id: String,
    subject_id: String,
    marks: f64,
    exam_type: String,
    academic_year: String,
    semester: String,
    remarks: Option<String>,
}

fn entry_str(raw: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    match raw.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(HandlerErr::new("bad_params", format!("missing {}", key))),
    }
}

fn parse_entry(raw: &serde_json::Value) -> Result<GradeEntry, HandlerErr> {
    if !raw.is_object() {
        return Err(HandlerErr::new("bad_params", "grade entry must be an object"));
    }
    let marks = match raw.get("marks") {
        None | Some(serde_json::Value::Null) => {
            return Err(HandlerErr::new("bad_params", "missing marks"))
        }
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .ok_or_else(|| HandlerErr::new("bad_params", "marks must be a number"))?,
    };
    let exam_type = entry_str(raw, "examType")?;
    if !EXAM_TYPES.contains(&exam_type.as_str()) {
        return Err(HandlerErr::new(
            "bad_params",
            format!("examType must be one of: {}", EXAM_TYPES.join(", ")),
        )
        .with_details(json!({ "examType": exam_type })));
    }
    Ok(GradeEntry {
        student_id: entry_str(raw, "studentId")?,
        subject_id: entry_str(raw, "subjectId")?,
        marks,
        exam_type,
        academic_year: entry_str(raw, "academicYear")?,
        semester: entry_str(raw, "semester")?,
        remarks: raw
            .get("remarks")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    })
}

/// Teachers may only grade subjects assigned to them; unassigned subjects are open.
fn check_subject_teacher(
    conn: &Connection,
    actor: &Actor,
    subject_id: &str,
) -> Result<(), HandlerErr> {
    if actor.role != Role::Teacher {
        return Ok(());
    }
    let teacher: Option<Option<String>> = conn
        .query_row(
            "SELECT teacher_id FROM subjects WHERE id = ?",
            [subject_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    match teacher.flatten() {
        Some(t) if t != actor.user_id => Err(HandlerErr::new(
            "forbidden",
            "subject is assigned to another teacher",
        )
        .with_details(json!({ "subjectId": subject_id }))),
        _ => Ok(()),
    }
}

struct Entered {
    grade_id: String,
    grade: grading::Grade,
    percentage: f64,
    created: bool,
}

fn enter_grade(conn: &Connection, actor: &Actor, entry: &GradeEntry) -> Result<Entered, HandlerErr> {
    let scale = db::subject_scale(conn, &entry.subject_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", "subject not found"))?;
    check_subject_teacher(conn, actor, &entry.subject_id)?;

    if entry.marks < 0.0 || entry.marks > scale.max_marks {
        return Err(HandlerErr::new(
            "bad_params",
            format!("marks must be between 0 and {}", scale.max_marks),
        )
        .with_details(json!({ "marks": entry.marks, "maxMarks": scale.max_marks })));
    }

    let enrolled = db::is_enrolled(
        conn,
        &entry.student_id,
        &entry.subject_id,
        &entry.academic_year,
        &entry.semester,
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if !enrolled {
        return Err(HandlerErr::new(
            "not_enrolled",
            "student is not enrolled in this subject for the given academic year and semester",
        ));
    }

    let grade = grading::classify(entry.marks, scale.max_marks)?;
    let percentage = grading::percentage(entry.marks, scale.max_marks)?;
    let (grade_id, created) = db::upsert_grade(
        conn,
        &GradeWrite {
            student_id: &entry.student_id,
            subject_id: &entry.subject_id,
            marks: entry.marks,
            grade: grade.as_str(),
            exam_type: &entry.exam_type,
            academic_year: &entry.academic_year,
            semester: &entry.semester,
            remarks: entry.remarks.as_deref(),
            graded_by: &actor.user_id,
        },
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", format!("{e:#}")))?;

    Ok(Entered {
        grade_id,
        grade,
        percentage,
        created,
    })
}

fn handle_grades_classify(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let marks = match required_f64(req, "marks") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_marks = match optional_f64(req, "maxMarks") {
        Ok(v) => v.unwrap_or(DEFAULT_MAX_MARKS),
        Err(e) => return e,
    };
    if marks < 0.0 {
        return err(&req.id, "bad_params", "marks must not be negative", None);
    }
    let graded = grading::classify(marks, max_marks)
        .and_then(|g| grading::percentage(marks, max_marks).map(|p| (g, p)));
    match graded {
        Ok((grade, percentage)) => ok(
            &req.id,
            json!({
                "grade": grade,
                "percentage": percentage,
                "points": grade.points(),
                "passing": grade.is_passing()
            }),
        ),
        Err(e) => grading_err(&req.id, &e),
    }
}

fn handle_grades_summarize(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("records").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "records must be an array", None);
    };
    let report = grading::records_from_json(raw)
        .and_then(|records| grading::performance_report(&records));
    match report {
        Ok(report) => ok(&req.id, json!(report)),
        Err(e) => grading_err(&req.id, &e),
    }
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match parse_actor(req) {
        Ok(a) => a,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut query = grade_query(req);
    if actor.role == Role::Student {
        if query.student_id.as_deref().is_some_and(|s| s != actor.user_id) {
            return err(
                &req.id,
                "forbidden",
                "students may only read their own grades",
                None,
            );
        }
        query.student_id = Some(actor.user_id.clone());
    }

    match db::fetch_graded_rows(conn, &query) {
        Ok(rows) => {
            debug!(count = rows.len(), "grades listed");
            ok(&req.id, json!({ "grades": rows, "count": rows.len() }))
        }
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_role(req, &[Role::Teacher, Role::Admin]) {
        Ok(a) => a,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let entry = match parse_entry(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match enter_grade(conn, &actor, &entry) {
        Ok(entered) => {
            info!(
                grade_id = %entered.grade_id,
                grade = %entered.grade,
                created = entered.created,
                "grade recorded"
            );
            let message = if entered.created {
                "Grade created"
            } else {
                "Grade updated"
            };
            ok(
                &req.id,
                json!({
                    "gradeId": entered.grade_id,
                    "grade": entered.grade,
                    "percentage": entered.percentage,
                    "created": entered.created,
                    "message": message
                }),
            )
        }
        Err(e) => {
            warn!(code = e.code, "grade entry rejected");
            e.response(&req.id)
        }
    }
}

fn handle_grades_enter_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_role(req, &[Role::Teacher, Role::Admin]) {
        Ok(a) => a,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(entries) = req.params.get("grades").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "grades must be an array", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut results: Vec<serde_json::Value> = Vec::with_capacity(entries.len());
    let mut saved = 0usize;
    for (i, raw) in entries.iter().enumerate() {
        let student_id = raw.get("studentId").cloned().unwrap_or(serde_json::Value::Null);
        let subject_id = raw.get("subjectId").cloned().unwrap_or(serde_json::Value::Null);
        let outcome = parse_entry(raw).and_then(|entry| enter_grade(&tx, &actor, &entry));
        match outcome {
            Ok(entered) => {
                saved += 1;
                results.push(json!({
                    "index": i,
                    "studentId": student_id,
                    "subjectId": subject_id,
                    "ok": true,
                    "gradeId": entered.grade_id,
                    "grade": entered.grade,
                    "percentage": entered.percentage,
                    "created": entered.created
                }));
            }
            Err(e) => {
                results.push(json!({
                    "index": i,
                    "studentId": student_id,
                    "subjectId": subject_id,
                    "ok": false,
                    "error": e.to_json()
                }));
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    info!(total = entries.len(), saved, "bulk grade entry");
    ok(
        &req.id,
        json!({
            "results": results,
            "savedCount": saved,
            "failedCount": entries.len() - saved
        }),
    )
}

fn handle_grades_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_role(req, &[Role::Teacher, Role::Admin]) {
        Ok(a) => a,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let current: Option<(String, f64, f64, Option<String>)> = match conn
        .query_row(
            "SELECT g.subject_id, g.marks, s.max_marks, g.remarks
             FROM grades g JOIN subjects s ON s.id = g.subject_id
             WHERE g.id = ?",
            [&grade_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((subject_id, old_marks, max_marks, old_remarks)) = current else {
        return err(&req.id, "not_found", "grade not found", None);
    };
    if let Err(e) = check_subject_teacher(conn, &actor, &subject_id) {
        return e.response(&req.id);
    }

    let marks = match optional_f64(req, "marks") {
        Ok(v) => v.unwrap_or(old_marks),
        Err(e) => return e,
    };
    if marks < 0.0 || marks > max_marks {
        return err(
            &req.id,
            "bad_params",
            format!("marks must be between 0 and {}", max_marks),
            Some(json!({ "marks": marks, "maxMarks": max_marks })),
        );
    }
    let remarks = match req.params.get("remarks") {
        Some(v) => v.as_str().map(str::to_string),
        None => old_remarks,
    };

    let grade = match grading::classify(marks, max_marks) {
        Ok(g) => g,
        Err(e) => return grading_err(&req.id, &e),
    };
    if let Err(e) = conn.execute(
        "UPDATE grades SET marks = ?, grade = ?, remarks = ?, graded_by = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            marks,
            grade.as_str(),
            remarks,
            &actor.user_id,
            db::now_rfc3339(),
            &grade_id
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    info!(grade_id = %grade_id, grade = %grade, "grade updated");
    ok(
        &req.id,
        json!({ "gradeId": grade_id, "marks": marks, "grade": grade }),
    )
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_role(req, &[Role::Teacher, Role::Admin]) {
        Ok(a) => a,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let subject_id: Option<String> = match conn
        .query_row(
            "SELECT subject_id FROM grades WHERE id = ?",
            [&grade_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(subject_id) = subject_id else {
        return err(&req.id, "not_found", "grade not found", None);
    };
    if let Err(e) = check_subject_teacher(conn, &actor, &subject_id) {
        return e.response(&req.id);
    }

    if let Err(e) = conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    info!(grade_id = %grade_id, "grade deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.classify" => Some(handle_grades_classify(state, req)),
        "grades.summarize" => Some(handle_grades_summarize(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        "grades.enterBulk" => Some(handle_grades_enter_bulk(state, req)),
        "grades.update" => Some(handle_grades_update(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}
