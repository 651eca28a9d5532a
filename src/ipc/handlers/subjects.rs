use crate::db;
use crate::grading::DEFAULT_MAX_MARKS;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, one_of, optional_f64, optional_str, parse_actor, require_role, required_f64,
    required_str, write_err, Role, STUDY_YEARS,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, OptionalExtension};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_PASSING_MARKS: f64 = 33.0;

fn subject_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "subjectCode": row.get::<_, String>(1)?,
        "subjectName": row.get::<_, String>(2)?,
        "department": row.get::<_, String>(3)?,
        "year": row.get::<_, String>(4)?,
        "credits": row.get::<_, f64>(5)?,
        "maxMarks": row.get::<_, f64>(6)?,
        "passingMarks": row.get::<_, f64>(7)?,
        "teacherId": row.get::<_, Option<String>>(8)?,
        "description": row.get::<_, Option<String>>(9)?,
        "active": row.get::<_, i64>(10)? != 0,
    }))
}

const SUBJECT_COLUMNS: &str = "id, subject_code, subject_name, department, year, credits, max_marks, passing_marks, teacher_id, description, active";

fn check_credits(req: &Request, credits: f64) -> Result<(), serde_json::Value> {
    if credits.fract() == 0.0 && (1.0..=6.0).contains(&credits) {
        Ok(())
    } else {
        Err(err(
            &req.id,
            "bad_params",
            "credits must be a whole number between 1 and 6",
            Some(json!({ "credits": credits })),
        ))
    }
}

fn check_max_marks(req: &Request, max_marks: f64) -> Result<(), serde_json::Value> {
    if (1.0..=1000.0).contains(&max_marks) {
        Ok(())
    } else {
        Err(err(
            &req.id,
            "bad_params",
            "maxMarks must be between 1 and 1000",
            Some(json!({ "maxMarks": max_marks })),
        ))
    }
}

fn check_teacher(
    conn: &rusqlite::Connection,
    req: &Request,
    teacher_id: &str,
) -> Result<(), serde_json::Value> {
    match db::user_role(conn, teacher_id) {
        Ok(Some(r)) if r == "teacher" => Ok(()),
        Ok(Some(_)) => Err(err(
            &req.id,
            "bad_params",
            "teacherId does not belong to a teacher",
            Some(json!({ "teacherId": teacher_id })),
        )),
        Ok(None) => Err(err(&req.id, "not_found", "teacher not found", None)),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match parse_actor(req) {
        Ok(a) => a,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut clauses: Vec<&str> = vec!["active = 1"];
    let mut binds: Vec<Value> = Vec::new();
    if let Some(d) = optional_str(req, "department") {
        clauses.push("department = ?");
        binds.push(Value::Text(d));
    }
    if let Some(y) = optional_str(req, "year") {
        clauses.push("year = ?");
        binds.push(Value::Text(y));
    }
    let mine = req.params.get("mine").and_then(|v| v.as_bool()).unwrap_or(false);
    let teacher_filter = if mine && actor.role == Role::Teacher {
        Some(actor.user_id.clone())
    } else {
        optional_str(req, "teacherId")
    };
    if let Some(t) = teacher_filter {
        clauses.push("teacher_id = ?");
        binds.push(Value::Text(t));
    }

    let sql = format!(
        "SELECT {} FROM subjects WHERE {} ORDER BY subject_name",
        SUBJECT_COLUMNS,
        clauses.join(" AND ")
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), subject_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(subjects) => {
            debug!(count = subjects.len(), "subjects listed");
            ok(&req.id, json!({ "subjects": subjects }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let code = match required_str(req, "subjectCode") {
        Ok(v) => v.to_ascii_uppercase(),
        Err(e) => return e,
    };
    let name = match required_str(req, "subjectName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let department = match required_str(req, "department") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = match required_str(req, "year") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = one_of(req, "year", &year, &STUDY_YEARS) {
        return e;
    }
    let credits = match required_f64(req, "credits") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = check_credits(req, credits) {
        return e;
    }
    let max_marks = match optional_f64(req, "maxMarks") {
        Ok(v) => v.unwrap_or(DEFAULT_MAX_MARKS),
        Err(e) => return e,
    };
    if let Err(e) = check_max_marks(req, max_marks) {
        return e;
    }
    let passing_marks = match optional_f64(req, "passingMarks") {
        Ok(v) => v.unwrap_or(DEFAULT_PASSING_MARKS),
        Err(e) => return e,
    };
    if passing_marks < 0.0 || passing_marks > max_marks {
        return err(
            &req.id,
            "bad_params",
            "passingMarks must be between 0 and maxMarks",
            None,
        );
    }
    let teacher_id = optional_str(req, "teacherId");
    if let Some(t) = teacher_id.as_deref() {
        if let Err(e) = check_teacher(conn, req, t) {
            return e;
        }
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, subject_code, subject_name, department, year, credits, max_marks, passing_marks, teacher_id, description, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        rusqlite::params![
            &subject_id,
            &code,
            &name,
            &department,
            &year,
            credits,
            max_marks,
            passing_marks,
            teacher_id,
            optional_str(req, "description"),
        ],
    ) {
        return write_err(req, "db_insert_failed", "subjects", &e);
    }

    info!(subject_id = %subject_id, code = %code, "subject created");
    ok(
        &req.id,
        json!({ "subjectId": subject_id, "subjectCode": code }),
    )
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let current_max: Option<f64> = match conn
        .query_row(
            "SELECT max_marks FROM subjects WHERE id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(current_max) = current_max else {
        return err(&req.id, "not_found", "subject not found", None);
    };

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (key, column) in [
        ("subjectName", "subject_name = ?"),
        ("department", "department = ?"),
        ("description", "description = ?"),
    ] {
        if let Some(v) = optional_str(req, key) {
            sets.push(column);
            binds.push(Value::Text(v));
        }
    }
    if let Some(y) = optional_str(req, "year") {
        if let Err(e) = one_of(req, "year", &y, &STUDY_YEARS) {
            return e;
        }
        sets.push("year = ?");
        binds.push(Value::Text(y));
    }
    match optional_f64(req, "credits") {
        Ok(Some(c)) => {
            if let Err(e) = check_credits(req, c) {
                return e;
            }
            sets.push("credits = ?");
            binds.push(Value::Real(c));
        }
        Ok(None) => {}
        Err(e) => return e,
    }
    let new_max = match optional_f64(req, "maxMarks") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(m) = new_max {
        if let Err(e) = check_max_marks(req, m) {
            return e;
        }
        sets.push("max_marks = ?");
        binds.push(Value::Real(m));
    }
    match optional_f64(req, "passingMarks") {
        Ok(Some(p)) => {
            if p < 0.0 || p > new_max.unwrap_or(current_max) {
                return err(
                    &req.id,
                    "bad_params",
                    "passingMarks must be between 0 and maxMarks",
                    None,
                );
            }
            sets.push("passing_marks = ?");
            binds.push(Value::Real(p));
        }
        Ok(None) => {}
        Err(e) => return e,
    }
    if let Some(t) = optional_str(req, "teacherId") {
        if let Err(e) = check_teacher(conn, req, &t) {
            return e;
        }
        sets.push("teacher_id = ?");
        binds.push(Value::Text(t));
    }
    if let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) {
        sets.push("active = ?");
        binds.push(Value::Integer(active as i64));
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    binds.push(Value::Text(subject_id.clone()));
    let sql = format!("UPDATE subjects SET {} WHERE id = ?", sets.join(", "));
    if let Err(e) = tx.execute(&sql, params_from_iter(binds)) {
        let _ = tx.rollback();
        return write_err(req, "db_update_failed", "subjects", &e);
    }

    // A new scale changes what every stored mark is worth.
    let mut regraded = 0usize;
    if let Some(m) = new_max.filter(|m| *m != current_max) {
        regraded = match db::regrade_subject(&tx, &subject_id, m) {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_update_failed",
                    format!("{e:#}"),
                    Some(json!({ "table": "grades" })),
                );
            }
        };
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    info!(subject_id = %subject_id, regraded, "subject updated");
    ok(&req.id, json!({ "ok": true, "regradedCount": regraded }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // No ON DELETE CASCADE; remove dependents first.
    for (table, sql) in [
        ("grades", "DELETE FROM grades WHERE subject_id = ?"),
        ("enrollments", "DELETE FROM enrollments WHERE subject_id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&subject_id]) {
            let _ = tx.rollback();
            return write_err(req, "db_delete_failed", table, &e);
        }
    }
    match tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        Ok(0) => {
            let _ = tx.rollback();
            return err(&req.id, "not_found", "subject not found", None);
        }
        Ok(_) => {}
        Err(e) => {
            let _ = tx.rollback();
            return write_err(req, "db_delete_failed", "subjects", &e);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    info!(subject_id = %subject_id, "subject deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
