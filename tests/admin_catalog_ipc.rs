mod test_support;

use serde_json::json;
use test_support::{
    actor, admin, request_err, request_ok, spawn_sidecar, str_field, temp_dir, with_actor,
};

#[test]
fn user_and_subject_validation_and_conflicts() {
    let workspace = temp_dir("gradebook-admin-catalog");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Students need a student number; years come from a fixed list.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        with_actor(
            admin(),
            json!({ "username": "nono", "email": "nono@example.edu", "role": "student" }),
        ),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        with_actor(
            admin(),
            json!({
                "username": "fifth",
                "email": "fifth@example.edu",
                "role": "student",
                "profile": { "studentId": "S-9", "year": "5th Year" }
            }),
        ),
    );
    assert_eq!(code, "bad_params");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        with_actor(
            admin(),
            json!({
                "username": "ines",
                "email": "ines@example.edu",
                "role": "student",
                "profile": { "studentId": "S-6001", "department": "Mathematics", "year": "1st Year" }
            }),
        ),
    );
    let student_id = str_field(&student, "userId");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "users.create",
        with_actor(
            admin(),
            json!({
                "username": "ines",
                "email": "other@example.edu",
                "role": "teacher"
            }),
        ),
    );
    assert_eq!(code, "conflict");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "users.create",
        with_actor(
            actor("t-1", "teacher"),
            json!({ "username": "x", "email": "x@example.edu", "role": "admin" }),
        ),
    );
    assert_eq!(code, "forbidden");

    for (id, credits, max_marks) in [("7", 0.5, 100.0), ("8", 7.0, 100.0), ("9", 3.0, 0.0)] {
        let code = request_err(
            &mut stdin,
            &mut reader,
            id,
            "subjects.create",
            with_actor(
                admin(),
                json!({
                    "subjectCode": "MTH101",
                    "subjectName": "Calculus",
                    "department": "Mathematics",
                    "year": "1st Year",
                    "credits": credits,
                    "maxMarks": max_marks
                }),
            ),
        );
        assert_eq!(code, "bad_params", "credits {} maxMarks {}", credits, max_marks);
    }

    let code = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "subjects.create",
        with_actor(
            admin(),
            json!({
                "subjectCode": "MTH101",
                "subjectName": "Calculus",
                "department": "Mathematics",
                "year": "1st Year",
                "credits": 4,
                "teacherId": student_id
            }),
        ),
    );
    assert_eq!(code, "bad_params");

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "subjects.create",
        with_actor(
            admin(),
            json!({
                "subjectCode": "MTH101",
                "subjectName": "Calculus",
                "department": "Mathematics",
                "year": "1st Year",
                "credits": 4
            }),
        ),
    );
    let subject_id = str_field(&subject, "subjectId");

    let enroll = json!({
        "studentId": student_id,
        "subjectId": subject_id,
        "academicYear": "2024-2025",
        "semester": "1"
    });
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "enrollments.create",
        with_actor(admin(), enroll.clone()),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "13",
        "enrollments.create",
        with_actor(admin(), enroll),
    );
    assert_eq!(code, "conflict");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "grades.upsert",
        with_actor(
            admin(),
            json!({
                "studentId": student_id,
                "subjectId": subject_id,
                "marks": 66,
                "examType": "Quiz",
                "academicYear": "2024-2025",
                "semester": "1"
            }),
        ),
    );

    // Referenced users cannot be deleted.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "15",
        "users.delete",
        with_actor(admin(), json!({ "userId": student_id })),
    );
    assert_eq!(code, "conflict");

    // Deleting the subject takes its enrollments and grades with it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "subjects.delete",
        with_actor(admin(), json!({ "subjectId": subject_id })),
    );
    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "grades.list",
        with_actor(admin(), json!({})),
    );
    assert_eq!(grades["count"], json!(0));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "users.delete",
        with_actor(admin(), json!({ "userId": student_id })),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "19",
        "users.delete",
        with_actor(admin(), json!({ "userId": student_id })),
    );
    assert_eq!(code, "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
