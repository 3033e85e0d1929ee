use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// One structured line in the run log. Fields are flat so the JSONL
/// output stays grep-able across processes.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub workspace_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub step: Option<u32>,
    pub tool: Option<&'a str>,
    pub status: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn emit_event(level: Level, event: RunEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "tiller.obs",
            event = event.event,
            component = event.component,
            workspace_id = event.workspace_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            step = event.step.unwrap_or(0),
            tool = event.tool.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "run_event"
        ),
        Level::WARN => tracing::warn!(
            target: "tiller.obs",
            event = event.event,
            component = event.component,
            workspace_id = event.workspace_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            step = event.step.unwrap_or(0),
            tool = event.tool.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "run_event"
        ),
        Level::INFO => tracing::info!(
            target: "tiller.obs",
            event = event.event,
            component = event.component,
            workspace_id = event.workspace_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            step = event.step.unwrap_or(0),
            tool = event.tool.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "run_event"
        ),
        _ => tracing::debug!(
            target: "tiller.obs",
            event = event.event,
            component = event.component,
            workspace_id = event.workspace_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            step = event.step.unwrap_or(0),
            tool = event.tool.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "run_event"
        ),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Installs the process-wide subscriber: daily-rolled JSONL file plus a
/// compact console layer. Returns the appender guard; drop it only at
/// process exit or buffered lines are lost.
pub fn init_process_logging(
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("tiller")
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        logs_dir: logs_dir.display().to_string(),
        prefix: "tiller".to_string(),
        retention_days,
        initialized_at: Utc::now(),
    };
    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("tiller.") || !name.ends_with(".jsonl") {
            continue;
        }
        // expected: tiller.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches("tiller.").trim_end_matches(".jsonl");
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };
        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }
    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}
