use crate::db::{self, GradeQuery, GradeRow};
use crate::grading::{self, Grade, PerformanceReport};
use crate::ipc::error::{err, grading_err, ok};
use crate::ipc::helpers::{
    db_conn, grade_query, optional_str, parse_actor, require_role, required_str, Role,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

fn fetch_rows(conn: &Connection, req: &Request, q: &GradeQuery) -> Result<Vec<GradeRow>, serde_json::Value> {
    db::fetch_graded_rows(conn, q)
        .map_err(|e| err(&req.id, "db_query_failed", format!("{e:#}"), None))
}

fn summarize(req: &Request, rows: &[GradeRow]) -> Result<PerformanceReport, serde_json::Value> {
    grading::performance_report(&db::graded_records(rows)).map_err(|e| grading_err(&req.id, &e))
}

fn handle_student_performance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match parse_actor(req) {
        Ok(a) => a,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let requested = optional_str(req, "studentId");
    let student_id = match actor.role {
        Role::Student => {
            if requested.as_deref().is_some_and(|s| s != actor.user_id) {
                return err(
                    &req.id,
                    "forbidden",
                    "students may only read their own report",
                    None,
                );
            }
            actor.user_id.clone()
        }
        Role::Teacher | Role::Admin => match requested {
            Some(s) => s,
            None => return err(&req.id, "bad_params", "missing studentId", None),
        },
    };

    match db::user_role(conn, &student_id) {
        Ok(Some(r)) if r == "student" => {}
        Ok(_) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let academic_year = optional_str(req, "academicYear");
    let semester = optional_str(req, "semester");
    let rows = match fetch_rows(
        conn,
        req,
        &GradeQuery {
            student_id: Some(student_id.clone()),
            academic_year: academic_year.clone(),
            semester: semester.clone(),
            ..GradeQuery::default()
        },
    ) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let performance = match summarize(req, &rows) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT e.id, s.id, s.subject_code, s.subject_name, s.credits, s.department,
                e.academic_year, e.semester
         FROM enrollments e
         JOIN subjects s ON s.id = e.subject_id
         WHERE e.student_id = ?1
           AND (?2 IS NULL OR e.academic_year = ?2)
           AND (?3 IS NULL OR e.semester = ?3)
         ORDER BY s.subject_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let enrollments = stmt
        .query_map((&student_id, &academic_year, &semester), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subject": {
                    "id": r.get::<_, String>(1)?,
                    "subjectCode": r.get::<_, String>(2)?,
                    "subjectName": r.get::<_, String>(3)?,
                    "credits": r.get::<_, f64>(4)?,
                    "department": r.get::<_, String>(5)?,
                },
                "academicYear": r.get::<_, String>(6)?,
                "semester": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let enrollments = match enrollments {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    debug!(student_id = %student_id, grades = rows.len(), "student report built");
    ok(
        &req.id,
        json!({
            "academicInfo": {
                "studentId": student_id,
                "academicYear": academic_year.as_deref().unwrap_or("All"),
                "semester": semester.as_deref().unwrap_or("All"),
                "reportGeneratedAt": db::now_rfc3339(),
            },
            "grades": rows,
            "enrollments": enrollments,
            "gradeDistribution": performance.summary.grade_distribution,
            "performance": performance,
        }),
    )
}

fn handle_subject_statistics(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Teacher, Role::Admin]) {
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

    let subject: Option<(String, String, f64, f64)> = match conn
        .query_row(
            "SELECT subject_code, subject_name, credits, max_marks FROM subjects WHERE id = ?",
            [&subject_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((code, name, credits, max_marks)) = subject else {
        return err(&req.id, "not_found", "subject not found", None);
    };

    let mut q = grade_query(req);
    q.subject_id = Some(subject_id.clone());
    q.student_id = None;
    let rows = match fetch_rows(conn, req, &q) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let summary = match grading::aggregate(&db::graded_records(&rows)) {
        Ok(v) => v,
        Err(e) => return grading_err(&req.id, &e),
    };
    let total_students = rows
        .iter()
        .map(|r| r.student_id.as_str())
        .collect::<HashSet<_>>()
        .len();

    ok(
        &req.id,
        json!({
            "subject": {
                "id": subject_id,
                "subjectCode": code,
                "subjectName": name,
                "credits": credits,
                "maxMarks": max_marks,
            },
            "grades": rows,
            "statistics": {
                "totalStudents": total_students,
                "summary": summary,
            },
        }),
    )
}

fn handle_class_performance(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Teacher, Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
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
    let academic_year = optional_str(req, "academicYear");
    let semester = optional_str(req, "semester");

    let mut stmt = match conn.prepare(
        "SELECT id, username, first_name, last_name, student_no
         FROM users
         WHERE role = 'student' AND active = 1 AND department = ? AND year = ?
         ORDER BY last_name, first_name, username",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = stmt
        .query_map((&department, &year), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let students = match students {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = match fetch_rows(
        conn,
        req,
        &GradeQuery {
            department: Some(department.clone()),
            year: Some(year.clone()),
            academic_year: academic_year.clone(),
            semester: semester.clone(),
            ..GradeQuery::default()
        },
    ) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active_ids: HashSet<&str> = students.iter().map(|s| s.0.as_str()).collect();
    let rows: Vec<GradeRow> = rows
        .into_iter()
        .filter(|r| active_ids.contains(r.student_id.as_str()))
        .collect();

    let summary = match grading::aggregate(&db::graded_records(&rows)) {
        Ok(v) => v,
        Err(e) => return grading_err(&req.id, &e),
    };

    let mut by_student: BTreeMap<&str, Vec<GradeRow>> = BTreeMap::new();
    for r in &rows {
        by_student
            .entry(r.student_id.as_str())
            .or_default()
            .push(r.clone());
    }

    let mut per_student: Vec<serde_json::Value> = Vec::with_capacity(students.len());
    for (id, username, first, last, student_no) in &students {
        let own = by_student.remove(id.as_str()).unwrap_or_default();
        let performance = match summarize(req, &own) {
            Ok(v) => v,
            Err(e) => return e,
        };
        per_student.push(json!({
            "id": id,
            "username": username,
            "firstName": first,
            "lastName": last,
            "studentId": student_no,
            "grades": own,
            "performance": performance,
        }));
    }

    ok(
        &req.id,
        json!({
            "classInfo": {
                "department": department,
                "year": year,
                "academicYear": academic_year,
                "semester": semester,
            },
            "statistics": {
                "totalStudents": students.len(),
                "totalGrades": summary.total_subjects,
                "averageMarks": summary.average_marks,
                "passRate": summary.pass_percentage,
                "gradeDistribution": summary.grade_distribution,
            },
            "students": per_student,
        }),
    )
}

fn handle_grade_statistics(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let q = GradeQuery {
        academic_year: optional_str(req, "academicYear"),
        semester: optional_str(req, "semester"),
        department: optional_str(req, "department"),
        year: optional_str(req, "year"),
        ..GradeQuery::default()
    };
    let rows = match fetch_rows(conn, req, &q) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match grading::aggregate(&db::graded_records(&rows)) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "totalGrades": summary.total_subjects,
                "totalMarks": summary.total_marks,
                "averageMarks": summary.average_marks,
                "passedGrades": summary.passed_subjects,
                "failedGrades": summary.failed_subjects,
                "passRate": summary.pass_percentage,
                "gradeDistribution": summary.grade_distribution,
            }),
        ),
        Err(e) => grading_err(&req.id, &e),
    }
}

fn count_groups(conn: &Connection, column: &str) -> rusqlite::Result<Vec<serde_json::Value>> {
    let sql = format!(
        "SELECT COALESCE({col}, ''), COUNT(*) AS n
         FROM users
         WHERE role = 'student'
         GROUP BY {col}
         ORDER BY n DESC, {col}",
        col = column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({ "id": r.get::<_, String>(0)?, "count": r.get::<_, i64>(1)? }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_system_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_role(req, &[Role::Admin]) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let counts: rusqlite::Result<(i64, i64, i64, i64, i64, i64, i64)> = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM users),
           (SELECT COUNT(*) FROM users WHERE role = 'student'),
           (SELECT COUNT(*) FROM users WHERE role = 'teacher'),
           (SELECT COUNT(*) FROM users WHERE role = 'admin'),
           (SELECT COUNT(*) FROM subjects),
           (SELECT COUNT(*) FROM grades),
           (SELECT COUNT(*) FROM enrollments)",
        [],
        |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
            ))
        },
    );
    let (users, students, teachers, admins, subjects, grades, enrollments) = match counts {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let department_stats = match count_groups(conn, "department") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let year_stats = match count_groups(conn, "year") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Distribution over the letter scale, zero-filled for dashboards.
    let mut distribution: BTreeMap<Grade, i64> = Grade::ALL.iter().map(|g| (*g, 0)).collect();
    let mut stmt = match conn.prepare("SELECT grade, COUNT(*) FROM grades GROUP BY grade") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grade_counts = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match grade_counts {
        Ok(v) => {
            for (letter, n) in v {
                match letter.parse::<Grade>() {
                    Ok(g) => distribution.insert(g, n),
                    Err(e) => {
                        return err(
                            &req.id,
                            "unknown_grade",
                            e.to_string(),
                            Some(json!({ "grade": letter })),
                        )
                    }
                };
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    ok(
        &req.id,
        json!({
            "users": {
                "total": users,
                "students": students,
                "teachers": teachers,
                "admins": admins,
            },
            "academic": {
                "subjects": subjects,
                "grades": grades,
                "enrollments": enrollments,
            },
            "gradeCounts": distribution,
            "departmentStats": department_stats,
            "yearStats": year_stats,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentPerformance" => Some(handle_student_performance(state, req)),
        "reports.subjectStatistics" => Some(handle_subject_statistics(state, req)),
        "reports.classPerformance" => Some(handle_class_performance(state, req)),
        "reports.gradeStatistics" => Some(handle_grade_statistics(state, req)),
        "reports.systemStats" => Some(handle_system_stats(state, req)),
        _ => None,
    }
}
