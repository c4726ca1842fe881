mod backup;
mod calc;
mod config;
mod curriculum;
mod db;
mod ipc;
mod repo;
mod sheet;
mod telemetry;

use std::io::{self, BufRead, Write};

fn write_line(stdout: &mut io::Stdout, value: &serde_json::Value) {
    let line = serde_json::to_string(value).unwrap_or_else(|_| "{\"ok\":false}".to_string());
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

fn main() {
    let config = config::DaemonConfig::from_env();
    if let Err(e) = telemetry::init(&config) {
        eprintln!("gradebookd: {e}");
    }

    let mut state = ipc::AppState::default();
    if let Some(workspace) = config.workspace.as_deref() {
        if let Err(e) = ipc::select_workspace(&mut state, workspace) {
            tracing::error!(workspace = %workspace.display(), error = %e, "auto-select failed");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gradebookd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                write_line(&mut stdout, &ipc::bad_json(e.to_string()));
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        write_line(&mut stdout, &resp);
    }
}
