use crate::db::GradeQuery;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use tracing::warn;

pub const EXAM_TYPES: [&str; 5] = ["Midterm", "Final", "Assignment", "Quiz", "Project"];
pub const STUDY_YEARS: [&str; 4] = ["1st Year", "2nd Year", "3rd Year", "4th Year"];

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        )),
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

/// Absent, null and blank strings all read as "no filter".
pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => {
            Err(err(&req.id, "bad_params", format!("missing {}", key), None))
        }
        Some(v) => v.as_f64().filter(|n| n.is_finite()).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be a number", key),
                None,
            )
        }),
    }
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(_) => required_f64(req, key).map(Some),
    }
}

pub fn one_of(
    req: &Request,
    key: &str,
    value: &str,
    allowed: &[&str],
) -> Result<(), serde_json::Value> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(err(
            &req.id,
            "bad_params",
            format!("{} must be one of: {}", key, allowed.join(", ")),
            Some(json!({ key: value })),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }
}

/// Caller identity. Verified upstream; carried on every request that needs it
/// as `params.actor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

pub fn parse_actor(req: &Request) -> Result<Actor, serde_json::Value> {
    let Some(raw) = req.params.get("actor").and_then(|v| v.as_object()) else {
        return Err(err(&req.id, "unauthorized", "missing params.actor", None));
    };
    let user_id = raw
        .get("userId")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let role = raw.get("role").and_then(|v| v.as_str()).and_then(Role::parse);
    match (user_id, role) {
        (Some(user_id), Some(role)) => Ok(Actor {
            user_id: user_id.to_string(),
            role,
        }),
        _ => Err(err(
            &req.id,
            "unauthorized",
            "actor must carry userId and role (student, teacher or admin)",
            None,
        )),
    }
}

pub fn require_role(req: &Request, allowed: &[Role]) -> Result<Actor, serde_json::Value> {
    let actor = parse_actor(req)?;
    if allowed.contains(&actor.role) {
        return Ok(actor);
    }
    warn!(method = %req.method, role = actor.role.as_str(), "role not permitted");
    Err(err(
        &req.id,
        "forbidden",
        format!("{} may not call {}", actor.role.as_str(), req.method),
        Some(json!({ "role": actor.role.as_str() })),
    ))
}

pub fn grade_query(req: &Request) -> GradeQuery {
    GradeQuery {
        student_id: optional_str(req, "studentId"),
        subject_id: optional_str(req, "subjectId"),
        academic_year: optional_str(req, "academicYear"),
        semester: optional_str(req, "semester"),
        exam_type: optional_str(req, "examType"),
        department: optional_str(req, "department"),
        year: optional_str(req, "year"),
    }
}

/// Unique-constraint failures surface as `conflict`, everything else as `code`.
pub fn write_err(req: &Request, code: &str, table: &str, e: &rusqlite::Error) -> serde_json::Value {
    if let rusqlite::Error::SqliteFailure(f, _) = e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return err(
                &req.id,
                "conflict",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    err(&req.id, code, e.to_string(), Some(json!({ "table": table })))
}
