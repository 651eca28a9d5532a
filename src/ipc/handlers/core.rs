use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    let schema_version = match state.db.as_ref() {
        Some(conn) => match db::settings_get_json(conn, "schema.version") {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "schema version unreadable");
                None
            }
        },
        None => None,
    };
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "schemaVersion": schema_version
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, path.clone()) {
        Ok(()) => ok(
            &req.id,
            json!({
                "workspacePath": path.to_string_lossy(),
                "schemaVersion": db::SCHEMA_VERSION
            }),
        ),
        Err(e) => {
            warn!(path = %path.to_string_lossy(), error = %e, "workspace open failed");
            err(&req.id, "db_open_failed", format!("{e:#}"), None)
        }
    }
}

/// Shared by `workspace.select` and the `--workspace` startup flag.
pub fn open_workspace(state: &mut AppState, path: PathBuf) -> anyhow::Result<()> {
    let conn = db::open_db(&path)?;
    // Best effort.
    let _ = db::settings_set_json(
        &conn,
        "workspace.lastOpenedAt",
        &json!(db::now_rfc3339()),
    );
    info!(path = %path.to_string_lossy(), "workspace opened");
    state.workspace = Some(path);
    state.db = Some(conn);
    Ok(())
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
