use anyhow::Result;
use clap::{Parser, ValueEnum};
use gradebookd::ipc;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Gradebook sidecar: JSON-lines requests on stdin, one response per line on stdout.
#[derive(Debug, Parser)]
#[command(name = "gradebookd", version, about)]
struct Cli {
    /// Workspace directory to open at startup
    #[arg(long, env = "GRADEBOOK_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Log output format (logs always go to stderr)
    #[arg(long, env = "GRADEBOOK_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("gradebookd=info".parse()?);
    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .compact(),
            )
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(io::stderr),
            )
            .init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let mut state = ipc::AppState::default();
    if let Some(path) = cli.workspace {
        let shown = path.display().to_string();
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            error!(workspace = %shown, error = %e, "failed to open workspace");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    info!("stdin closed, shutting down");
    Ok(())
}
