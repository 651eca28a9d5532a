use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, require_role, required_str, write_err, Role};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Teacher, Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (key, clause) in [
        ("subjectId", "e.subject_id = ?"),
        ("studentId", "e.student_id = ?"),
        ("academicYear", "e.academic_year = ?"),
        ("semester", "e.semester = ?"),
    ] {
        if let Some(v) = optional_str(req, key) {
            clauses.push(clause);
            binds.push(Value::Text(v));
        }
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT e.id, e.student_id, u.username, u.first_name, u.last_name, u.student_no,
                e.subject_id, s.subject_code, s.subject_name, s.credits,
                e.academic_year, e.semester, e.enrolled_at, e.active
         FROM enrollments e
         JOIN users u ON u.id = e.student_id
         JOIN subjects s ON s.id = e.subject_id
         {}
         ORDER BY s.subject_name, u.first_name, u.last_name",
        where_sql
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "student": {
                    "id": r.get::<_, String>(1)?,
                    "username": r.get::<_, String>(2)?,
                    "firstName": r.get::<_, Option<String>>(3)?,
                    "lastName": r.get::<_, Option<String>>(4)?,
                    "studentId": r.get::<_, Option<String>>(5)?,
                },
                "subject": {
                    "id": r.get::<_, String>(6)?,
                    "subjectCode": r.get::<_, String>(7)?,
                    "subjectName": r.get::<_, String>(8)?,
                    "credits": r.get::<_, f64>(9)?,
                },
                "academicYear": r.get::<_, String>(10)?,
                "semester": r.get::<_, String>(11)?,
                "enrolledAt": r.get::<_, String>(12)?,
                "active": r.get::<_, i64>(13)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut fields: Vec<String> = Vec::with_capacity(4);
    for key in ["studentId", "subjectId", "academicYear", "semester"] {
        match required_str(req, key) {
            Ok(v) => fields.push(v),
            Err(e) => return e,
        }
    }
    let [student_id, subject_id, academic_year, semester] = &fields[..] else {
        return err(&req.id, "bad_params", "missing enrollment fields", None);
    };

    match db::user_role(conn, student_id) {
        Ok(Some(r)) if r == "student" => {}
        Ok(Some(_)) => {
            return err(
                &req.id,
                "bad_params",
                "studentId does not belong to a student",
                None,
            )
        }
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let subject: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if subject.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(id, student_id, subject_id, academic_year, semester, enrolled_at, active)
         VALUES(?, ?, ?, ?, ?, ?, 1)",
        (
            &enrollment_id,
            student_id,
            subject_id,
            academic_year,
            semester,
            db::now_rfc3339(),
        ),
    ) {
        return write_err(req, "db_insert_failed", "enrollments", &e);
    }

    info!(enrollment_id = %enrollment_id, student_id = %student_id, subject_id = %subject_id, "student enrolled");
    ok(&req.id, json!({ "enrollmentId": enrollment_id }))
}

fn handle_enrollments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM enrollments WHERE id = ?", [&enrollment_id]) {
        Ok(0) => err(&req.id, "not_found", "enrollment not found", None),
        Ok(_) => {
            info!(enrollment_id = %enrollment_id, "enrollment removed");
            ok(&req.id, json!({ "ok": true }))
        }
        Err(e) => write_err(req, "db_delete_failed", "enrollments", &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.delete" => Some(handle_enrollments_delete(state, req)),
        _ => None,
    }
}
