mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{
    actor, admin, request_err, request_ok, spawn_sidecar, str_field, temp_dir, with_actor,
};

const YEAR: &str = "2024-2025";

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    username: &str,
    student_no: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "users.create",
        with_actor(
            admin(),
            json!({
                "username": username,
                "email": format!("{}@example.edu", username),
                "role": "student",
                "profile": {
                    "firstName": username,
                    "studentId": student_no,
                    "department": "Computer Science",
                    "year": "3rd Year"
                }
            }),
        ),
    );
    str_field(&created, "userId")
}

/// Enrolls the student and records a Final mark for each (subject, marks) pair.
fn grade_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_id: &str,
    subjects: &[(String, f64)],
) {
    for (i, (subject_id, marks)) in subjects.iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("enr-{}-{}", student_id, i),
            "enrollments.create",
            with_actor(
                admin(),
                json!({
                    "studentId": student_id,
                    "subjectId": subject_id,
                    "academicYear": YEAR,
                    "semester": "1"
                }),
            ),
        );
        let _ = request_ok(
            stdin,
            reader,
            &format!("grd-{}-{}", student_id, i),
            "grades.upsert",
            with_actor(
                admin(),
                json!({
                    "studentId": student_id,
                    "subjectId": subject_id,
                    "marks": marks,
                    "examType": "Final",
                    "academicYear": YEAR,
                    "semester": "1"
                }),
            ),
        );
    }
}

fn create_subjects(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> Vec<String> {
    let mut ids = Vec::new();
    for (i, (code, credits)) in [("CS301", 4), ("CS302", 3), ("CS303", 3), ("CS304", 4)]
        .iter()
        .enumerate()
    {
        let created = request_ok(
            stdin,
            reader,
            &format!("sub-{}", i),
            "subjects.create",
            with_actor(
                admin(),
                json!({
                    "subjectCode": code,
                    "subjectName": format!("Course {}", code),
                    "department": "Computer Science",
                    "year": "3rd Year",
                    "credits": credits
                }),
            ),
        );
        ids.push(str_field(&created, "subjectId"));
    }
    ids
}

#[test]
fn student_performance_report_computes_credit_weighted_gpa() {
    let workspace = temp_dir("gradebook-report-student");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subjects = create_subjects(&mut stdin, &mut reader);
    let student_id = create_student(&mut stdin, &mut reader, "2", "priya", "S-3001");
    let marks = [85.0, 78.0, 92.0, 88.0];
    let graded: Vec<(String, f64)> = subjects.iter().cloned().zip(marks).collect();
    grade_student(&mut stdin, &mut reader, &student_id, &graded);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.studentPerformance",
        with_actor(actor(&student_id, "student"), json!({})),
    );
    let perf = &report["performance"];
    assert_eq!(perf["totalSubjects"], json!(4));
    assert_eq!(perf["totalMarks"], json!(343.0));
    assert_eq!(perf["averageMarks"], json!(85.75));
    assert_eq!(perf["passedSubjects"], json!(4));
    assert_eq!(perf["failedSubjects"], json!(0));
    assert_eq!(perf["passPercentage"], json!(100.0));
    assert_eq!(perf["gpa"], json!(3.68));
    assert_eq!(
        report["gradeDistribution"],
        json!({ "A+": 1, "A": 2, "B+": 1 })
    );
    assert_eq!(report["academicInfo"]["academicYear"], json!("All"));
    assert_eq!(report["enrollments"].as_array().map(|v| v.len()), Some(4));

    // Filters narrow both grades and the summary.
    let other_term = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.studentPerformance",
        with_actor(
            admin(),
            json!({ "studentId": student_id, "academicYear": YEAR, "semester": "2" }),
        ),
    );
    assert_eq!(other_term["performance"]["totalSubjects"], json!(0));
    assert_eq!(other_term["performance"]["gpa"], json!(0.0));
    assert_eq!(other_term["gradeDistribution"], json!({}));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn students_only_see_their_own_report() {
    let workspace = temp_dir("gradebook-report-scope");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let first = create_student(&mut stdin, &mut reader, "2", "omar", "S-4001");
    let second = create_student(&mut stdin, &mut reader, "3", "lena", "S-4002");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "reports.studentPerformance",
        with_actor(actor(&first, "student"), json!({ "studentId": second })),
    );
    assert_eq!(code, "forbidden");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "grades.list",
        with_actor(actor(&first, "student"), json!({ "studentId": second })),
    );
    assert_eq!(code, "forbidden");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "reports.systemStats",
        with_actor(actor(&first, "student"), json!({})),
    );
    assert_eq!(code, "forbidden");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn class_subject_and_system_reports_agree() {
    let workspace = temp_dir("gradebook-report-class");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subjects = create_subjects(&mut stdin, &mut reader);
    let strong = create_student(&mut stdin, &mut reader, "2", "nadia", "S-5001");
    let weak = create_student(&mut stdin, &mut reader, "3", "tomas", "S-5002");
    let graded: Vec<(String, f64)> = subjects
        .iter()
        .cloned()
        .zip([85.0, 78.0, 92.0, 88.0])
        .collect();
    grade_student(&mut stdin, &mut reader, &strong, &graded);
    grade_student(&mut stdin, &mut reader, &weak, &[(subjects[0].clone(), 30.0)]);

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.classPerformance",
        with_actor(
            admin(),
            json!({ "department": "Computer Science", "year": "3rd Year" }),
        ),
    );
    let stats = &class["statistics"];
    assert_eq!(stats["totalStudents"], json!(2));
    assert_eq!(stats["totalGrades"], json!(5));
    assert_eq!(stats["averageMarks"], json!(74.6));
    assert_eq!(stats["passRate"], json!(80.0));
    assert_eq!(stats["gradeDistribution"]["F"], json!(1));
    let students = class["students"].as_array().expect("students");
    let weak_row = students
        .iter()
        .find(|s| s["id"] == json!(weak))
        .expect("weak student row");
    assert_eq!(weak_row["performance"]["gpa"], json!(0.0));

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.subjectStatistics",
        with_actor(admin(), json!({ "subjectId": subjects[0] })),
    );
    assert_eq!(subject["statistics"]["totalStudents"], json!(2));
    assert_eq!(subject["statistics"]["summary"]["averageMarks"], json!(57.5));
    assert_eq!(subject["statistics"]["summary"]["passPercentage"], json!(50.0));

    let overall = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.gradeStatistics",
        with_actor(admin(), json!({})),
    );
    assert_eq!(overall["totalGrades"], json!(5));
    assert_eq!(overall["failedGrades"], json!(1));

    let system = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.systemStats",
        with_actor(admin(), json!({})),
    );
    assert_eq!(system["users"]["students"], json!(2));
    assert_eq!(system["academic"]["subjects"], json!(4));
    assert_eq!(system["academic"]["grades"], json!(5));
    assert_eq!(system["gradeCounts"]["A"], json!(2));
    assert_eq!(system["gradeCounts"]["D"], json!(0));
    assert_eq!(
        system["departmentStats"][0],
        json!({ "id": "Computer Science", "count": 2 })
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn system_stats_flags_a_corrupt_stored_letter() {
    let workspace = temp_dir("gradebook-report-corrupt");
    {
        let conn = gradebookd::db::open_db(&workspace).expect("open workspace db");
        conn.execute_batch(
            "INSERT INTO users(id, username, email, role, created_at)
               VALUES('stu-x', 'xavi', 'xavi@example.edu', 'student', '2024-09-01T00:00:00Z');
             INSERT INTO subjects(id, subject_code, subject_name, department, year, credits)
               VALUES('sub-x', 'BIO110', 'Biology', 'Biology', '1st Year', 3);
             INSERT INTO grades(id, student_id, subject_id, marks, grade, exam_type,
                                academic_year, semester, graded_by, created_at, updated_at)
               VALUES('g-x', 'stu-x', 'sub-x', 55, 'E', 'Final', '2024-2025', '1', 'admin-1',
                      '2024-09-01T00:00:00Z', '2024-09-01T00:00:00Z');",
        )
        .expect("seed corrupt grade");
    }

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let resp = test_support::request(
        &mut stdin,
        &mut reader,
        "2",
        "reports.systemStats",
        with_actor(admin(), json!({})),
    );
    assert_eq!(resp["error"]["code"], json!("unknown_grade"));
    assert_eq!(resp["error"]["details"], json!({ "grade": "E" }));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
