//! Stage trace capture for pipeline runs.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// One line per executed stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageTrace {
    pub timestamp_ms: i64,
    pub run_id: Uuid,
    pub stage_index: usize,
    pub stage: String,
    pub policy: &'static str,
    pub status: &'static str,
    pub elapsed_ms: u64,
    /// "text", "structured" or "unavailable"; absent for aborted stages.
    pub artifact_kind: Option<&'static str>,
    pub artifact_chars: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: StageTrace) -> Result<(), TraceError>;
}

/// Sends events to a writer thread that appends JSON lines to a file.
#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<StageTrace>,
}

pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    /// Wait for the writer to drain. All sink clones must be dropped first.
    pub fn join(mut self) -> Result<(), TraceError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<StageTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: StageTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<StageTrace>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
