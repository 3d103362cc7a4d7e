use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle transitions recorded in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// First attempt published.
    Dispatched,
    /// Re-dispatched after a failure or timeout.
    Retried,
    /// Success applied.
    Completed,
    /// Gave up.
    Failed,
    /// An attempt's timer fired.
    TimedOut,
    /// Re-armed from a checkpoint at startup.
    Recovered,
}

/// One line of the task trace.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Which transition happened.
    pub kind: TraceKind,
    /// Task id.
    pub task_id: Uuid,
    /// Requested capability.
    pub capability: String,
    /// Agent holding the attempt when the event fired.
    pub agent_id: String,
    /// Dispatch generation at the time of the event.
    pub generation: u32,
    /// Attempts made so far.
    pub attempts: u32,
    /// Event-specific extras; omitted when null.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl TraceEvent {
    /// Snapshot `status` as a `kind` event stamped now.
    pub fn new(kind: TraceKind, status: &taskmesh_core::TaskStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            task_id: status.task_id,
            capability: status.capability.clone(),
            agent_id: status.dispatched_to.clone(),
            generation: status.generation,
            attempts: status.attempts,
            details: serde_json::Value::Null,
        }
    }

    /// Attach event-specific extras.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Non-blocking sink for [`TraceEvent`]s.
///
/// `emit` only enqueues; a background task owns the output.
#[derive(Clone)]
pub struct TraceSink {
    tx: Option<mpsc::UnboundedSender<TraceEvent>>,
}

impl TraceSink {
    /// Append events as JSON lines to `{dir}/events.jsonl`.
    ///
    /// Must be called within a tokio runtime.
    pub fn jsonl(dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TraceEvent>();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %e, "Trace directory unavailable");
                return;
            }
            let path = dir.join("events.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Trace file unavailable");
                    return;
                }
            };

            while let Some(event) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&event) else {
                    continue;
                };
                line.push('\n');
                let written = match file.write_all(line.as_bytes()).await {
                    Ok(()) => file.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    warn!(error = %e, "Failed to append trace event");
                }
            }
        });

        Self { tx: Some(tx) }
    }

    /// A sink that hands events to the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TraceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue `event`. Never blocks and never fails; a closed sink drops it.
    pub fn emit(&self, event: TraceEvent) {
        debug!(
            task_id = %event.task_id,
            kind = ?event.kind,
            agent = %event.agent_id,
            generation = event.generation,
            "trace"
        );
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
