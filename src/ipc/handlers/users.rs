use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, one_of, optional_str, require_role, required_str, write_err, Role, STUDY_YEARS,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn user_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "username": row.get::<_, String>(1)?,
        "email": row.get::<_, String>(2)?,
        "role": row.get::<_, String>(3)?,
        "profile": {
            "firstName": row.get::<_, Option<String>>(4)?,
            "lastName": row.get::<_, Option<String>>(5)?,
            "studentId": row.get::<_, Option<String>>(6)?,
            "department": row.get::<_, Option<String>>(7)?,
            "year": row.get::<_, Option<String>>(8)?,
        },
        "active": row.get::<_, i64>(9)? != 0,
        "createdAt": row.get::<_, String>(10)?,
    }))
}

const USER_COLUMNS: &str = "id, username, email, role, first_name, last_name, student_no, department, year, active, created_at";

fn profile_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get("profile")
        .and_then(|p| p.get(key))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let role = optional_str(req, "role");
    if let Some(r) = role.as_deref() {
        if Role::parse(r).is_none() {
            return err(
                &req.id,
                "bad_params",
                "role must be one of: student, teacher, admin",
                Some(json!({ "role": r })),
            );
        }
    }

    let mut binds: Vec<Value> = Vec::new();
    let where_sql = match role {
        Some(r) => {
            binds.push(Value::Text(r));
            "WHERE role = ?"
        }
        None => "",
    };
    let sql = format!(
        "SELECT {} FROM users {} ORDER BY username",
        USER_COLUMNS, where_sql
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), user_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users, "count": users.len() })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let username = match required_str(req, "username") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e,
    };
    if !email.contains('@') {
        return err(&req.id, "bad_params", "email must be a valid address", None);
    }
    let role = match required_str(req, "role") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(role) = Role::parse(&role) else {
        return err(
            &req.id,
            "bad_params",
            "role must be one of: student, teacher, admin",
            Some(json!({ "role": role })),
        );
    };

    let year = profile_str(req, "year");
    if let Some(y) = year.as_deref() {
        if let Err(e) = one_of(req, "profile.year", y, &STUDY_YEARS) {
            return e;
        }
    }
    let student_no = profile_str(req, "studentId");
    if role == Role::Student && student_no.is_none() {
        return err(
            &req.id,
            "bad_params",
            "students require profile.studentId",
            None,
        );
    }

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, username, email, role, first_name, last_name, student_no, department, year, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        rusqlite::params![
            &user_id,
            &username,
            &email,
            role.as_str(),
            profile_str(req, "firstName"),
            profile_str(req, "lastName"),
            student_no,
            profile_str(req, "department"),
            year,
            db::now_rfc3339(),
        ],
    ) {
        return write_err(req, "db_insert_failed", "users", &e);
    }

    info!(user_id = %user_id, role = role.as_str(), "user created");
    ok(
        &req.id,
        json!({ "userId": user_id, "username": username, "role": role.as_str() }),
    )
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(email) = optional_str(req, "email") {
        if !email.contains('@') {
            return err(&req.id, "bad_params", "email must be a valid address", None);
        }
        sets.push("email = ?");
        binds.push(Value::Text(email.to_ascii_lowercase()));
    }
    for (key, column) in [
        ("firstName", "first_name = ?"),
        ("lastName", "last_name = ?"),
        ("studentId", "student_no = ?"),
        ("department", "department = ?"),
        ("year", "year = ?"),
    ] {
        if let Some(v) = profile_str(req, key) {
            if key == "year" {
                if let Err(e) = one_of(req, "profile.year", &v, &STUDY_YEARS) {
                    return e;
                }
            }
            sets.push(column);
            binds.push(Value::Text(v));
        }
    }
    if let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) {
        sets.push("active = ?");
        binds.push(Value::Integer(active as i64));
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    binds.push(Value::Text(user_id.clone()));
    let sql = format!("UPDATE users SET {} WHERE id = ?", sets.join(", "));
    match conn.execute(&sql, params_from_iter(binds)) {
        Ok(0) => err(&req.id, "not_found", "user not found", None),
        Ok(_) => {
            info!(user_id = %user_id, "user updated");
            ok(&req.id, json!({ "ok": true }))
        }
        Err(e) => write_err(req, "db_update_failed", "users", &e),
    }
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "user not found", None);
    }

    let refs: Result<(i64, i64, i64), _> = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM grades WHERE student_id = ?1),
           (SELECT COUNT(*) FROM enrollments WHERE student_id = ?1),
           (SELECT COUNT(*) FROM subjects WHERE teacher_id = ?1)",
        [&user_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    );
    match refs {
        Ok((0, 0, 0)) => {}
        Ok((grades, enrollments, subjects)) => {
            return err(
                &req.id,
                "conflict",
                "user still has grades, enrollments or subjects; deactivate instead",
                Some(json!({
                    "grades": grades,
                    "enrollments": enrollments,
                    "subjects": subjects
                })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Err(e) = conn.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        return write_err(req, "db_delete_failed", "users", &e);
    }
    info!(user_id = %user_id, "user deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        _ => None,
    }
}
