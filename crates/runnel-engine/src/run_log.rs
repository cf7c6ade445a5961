use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use runnel_core::types::OrchestrationEvent;

/// JSONL run logger.
///
/// Consumes orchestration events and writes one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crash mid-run leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tick: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run summary, 2 = per tick, 3 = per step.
    pub fn new(log_dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            log_dir: log_dir.into(),
            level,
        }
    }

    /// Write events until the run ends, the channel closes or `cancel` fires.
    ///
    /// Subscribe before invoking the orchestrator so the first events are not
    /// missed. Returns the path of the log file, if one was opened.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<OrchestrationEvent>,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, dir = %self.log_dir.display(), "Failed to create log directory");
            return None;
        }

        let mut writer: Option<(PathBuf, BufWriter<tokio::fs::File>)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let terminal = event.is_terminal();
                            if let Some(entry) = self.event_to_entry(&event) {
                                if writer.is_none() {
                                    writer = self.open(&entry.run_id).await;
                                }
                                let Some((_, out)) = writer.as_mut() else {
                                    break;
                                };
                                if let Err(e) = write_entry(out, &entry).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                            }
                            if terminal {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        let (path, mut out) = writer?;
        out.flush().await.ok();
        debug!(path = %path.display(), "RunLogger finished");
        Some(path)
    }

    async fn open(&self, run_id: &str) -> Option<(PathBuf, BufWriter<tokio::fs::File>)> {
        let path = log_path(&self.log_dir, run_id);
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => {
                info!(path = %path.display(), "RunLogger started");
                Some((path, BufWriter::new(file)))
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to open log file");
                None
            }
        }
    }

    /// Convert an event to a log entry (`None` if filtered by level).
    fn event_to_entry(&self, event: &OrchestrationEvent) -> Option<LogEntry> {
        let run_id = event.run_id().0.clone();
        let entry = |event_type, tick, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.clone(),
            event_type,
            tick,
            detail,
        };

        match event {
            // L1: run summary
            OrchestrationEvent::RunStarted { entry: first, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "entry": first })),
            )),
            OrchestrationEvent::RunComplete {
                ticks,
                invocations,
                usage,
                ..
            } => Some(entry(
                "run_complete",
                Some(*ticks),
                Some(serde_json::json!({
                    "invocations": invocations,
                    "usage": usage,
                })),
            )),
            OrchestrationEvent::RunCancelled { ticks, exited, .. } => Some(entry(
                "run_cancelled",
                Some(*ticks),
                Some(serde_json::json!({ "exited": exited })),
            )),
            OrchestrationEvent::RunError { error, .. } => Some(entry(
                "run_error",
                None,
                Some(serde_json::json!({ "error": error })),
            )),
            OrchestrationEvent::BranchDropped { branch, .. } => Some(entry(
                "branch_dropped",
                None,
                serde_json::to_value(branch).ok(),
            )),
            OrchestrationEvent::JoinStranded { join, .. } => Some(entry(
                "join_stranded",
                None,
                serde_json::to_value(join).ok(),
            )),

            // L2: per tick
            OrchestrationEvent::TickStarted { tick, active, .. } if self.level >= 2 => Some(entry(
                "tick_started",
                Some(*tick),
                Some(serde_json::json!({ "active": active })),
            )),
            OrchestrationEvent::TickCompleted {
                tick,
                invocations,
                next_active,
                ..
            } if self.level >= 2 => Some(entry(
                "tick_completed",
                Some(*tick),
                Some(serde_json::json!({
                    "invocations": invocations,
                    "next_active": next_active,
                })),
            )),
            OrchestrationEvent::InvocationFailed {
                process_id,
                runnable,
                error,
                ..
            } if self.level >= 2 => Some(entry(
                "invocation_failed",
                None,
                Some(serde_json::json!({
                    "process_id": process_id,
                    "runnable": runnable,
                    "error": truncate_str(error, 500),
                })),
            )),
            OrchestrationEvent::BranchEnded {
                process_id,
                runnable,
                ..
            } if self.level >= 2 => Some(entry(
                "branch_ended",
                None,
                Some(serde_json::json!({
                    "process_id": process_id,
                    "runnable": runnable,
                })),
            )),

            // L3: per step
            OrchestrationEvent::StepRecorded { record, .. } if self.level >= 3 => Some(entry(
                "step_recorded",
                Some(record.tick),
                serde_json::to_value(record).ok(),
            )),

            _ => None,
        }
    }
}

/// Log file path for a run.
pub fn log_path(log_dir: &Path, run_id: &str) -> PathBuf {
    log_dir.join(format!("{}.jsonl", run_id))
}

async fn write_entry(out: &mut BufWriter<tokio::fs::File>, entry: &LogEntry) -> std::io::Result<()> {
    let json = serde_json::to_string(entry)?;
    out.write_all(json.as_bytes()).await?;
    out.write_all(b"\n").await?;
    // flush per line so partial runs stay readable
    out.flush().await
}

/// Truncate a string for logging, respecting char boundaries.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
