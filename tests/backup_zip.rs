mod test_support;

use gradebookd::{backup, db};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use test_support::{
    admin, request_err, request_ok, spawn_sidecar, str_field, temp_dir, with_actor,
};

fn seed_workspace(workspace: &Path, marker: &str) {
    let conn = db::open_db(workspace).expect("open workspace db");
    db::settings_set_json(&conn, "backup.marker", &json!(marker)).expect("write marker");
}

fn read_marker(workspace: &Path) -> Option<serde_json::Value> {
    let conn = db::open_db(workspace).expect("reopen workspace db");
    db::settings_get_json(&conn, "backup.marker").expect("read marker")
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("gradebook-backup-src");
    let workspace2 = temp_dir("gradebook-backup-dst");
    let out_dir = temp_dir("gradebook-backup-out");
    seed_workspace(&workspace, "exported");

    let bundle_path = out_dir.join("workspace.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT);
    assert_eq!(export.entry_count, 2);
    assert_eq!(export.db_sha256.len(), 64);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"], json!(backup::BUNDLE_FORMAT));
    assert_eq!(manifest["dbSha256"], json!(export.db_sha256));
    archive
        .by_name("db/gradebook.sqlite3")
        .expect("database entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT);
    assert!(import.checksum_verified);
    assert_eq!(read_marker(&workspace2), Some(json!("exported")));

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn raw_sqlite_import_is_supported() {
    let source = temp_dir("gradebook-backup-raw");
    let workspace = temp_dir("gradebook-backup-raw-dst");
    seed_workspace(&source, "raw copy");
    seed_workspace(&workspace, "before import");

    let raw_file = source.join("gradebook.sqlite3");
    let import = backup::import_workspace_bundle(&raw_file, &workspace).expect("import raw sqlite");
    assert_eq!(import.bundle_format_detected, backup::RAW_SQLITE_FORMAT);
    assert!(!import.checksum_verified);
    assert_eq!(read_marker(&workspace), Some(json!("raw copy")));
    assert!(!workspace.join("gradebook.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(source);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn non_database_file_is_rejected_and_workspace_still_opens() {
    let out_dir = temp_dir("gradebook-backup-notdb");
    let workspace = temp_dir("gradebook-backup-notdb-dst");
    seed_workspace(&workspace, "live data");

    let notes = out_dir.join("notes.txt");
    std::fs::write(&notes, "hello, this is not a database").expect("write notes");

    let e = backup::import_workspace_bundle(&notes, &workspace).expect_err("not a database");
    assert!(format!("{e:#}").contains("neither a workspace bundle nor a SQLite database"));
    assert_eq!(read_marker(&workspace), Some(json!("live data")));

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tampered_bundle_is_rejected_and_workspace_untouched() {
    let out_dir = temp_dir("gradebook-backup-tampered");
    let workspace = temp_dir("gradebook-backup-tampered-dst");
    let original = b"existing-database";
    std::fs::write(workspace.join("gradebook.sqlite3"), original).expect("write existing db");

    let bundle_path = out_dir.join("tampered.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(
            json!({
                "format": backup::BUNDLE_FORMAT,
                "version": 1,
                "dbSha256": "00".repeat(32)
            })
            .to_string()
            .as_bytes(),
        )
        .expect("write manifest");
        zip.start_file("db/gradebook.sqlite3", opts).expect("db entry");
        zip.write_all(b"replacement").expect("write db");
        zip.finish().expect("finish zip");
    }

    let e = backup::import_workspace_bundle(&bundle_path, &workspace).expect_err("checksum mismatch");
    assert!(format!("{e:#}").contains("checksum mismatch"));
    let kept = std::fs::read(workspace.join("gradebook.sqlite3")).expect("read existing db");
    assert_eq!(kept, original);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn ipc_import_restores_exported_state() {
    let workspace = temp_dir("gradebook-backup-ipc");
    let bundle = temp_dir("gradebook-backup-ipc-out").join("snapshot.zip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        with_actor(
            admin(),
            json!({ "username": "keep", "email": "keep@example.edu", "role": "teacher" }),
        ),
    );
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.exportWorkspace",
        with_actor(admin(), json!({ "outPath": bundle.to_string_lossy() })),
    );
    assert_eq!(exported["bundleFormat"], json!(backup::BUNDLE_FORMAT));

    let extra = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        with_actor(
            admin(),
            json!({ "username": "drop", "email": "drop@example.edu", "role": "teacher" }),
        ),
    );
    let _ = str_field(&extra, "userId");

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "backup.importWorkspace",
        with_actor(admin(), json!({ "inPath": bundle.to_string_lossy() })),
    );
    assert_eq!(imported["checksumVerified"], json!(true));

    let users = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "users.list",
        with_actor(admin(), json!({})),
    );
    assert_eq!(users["count"], json!(1));
    assert_eq!(users["users"][0]["username"], json!("keep"));

    let notes = bundle.with_file_name("notes.txt");
    std::fs::write(&notes, "grades,to,import\n").expect("write csv-ish file");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "backup.importWorkspace",
        with_actor(admin(), json!({ "inPath": notes.to_string_lossy() })),
    );
    assert_eq!(code, "backup_failed");
    let users = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "users.list",
        with_actor(admin(), json!({})),
    );
    assert_eq!(users["count"], json!(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    if let Some(dir) = bundle.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}
