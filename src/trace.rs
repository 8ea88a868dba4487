//! Per-phase trace capture for evaluations.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::types::EvaluationPhase;

/// One state-machine transition. Signals not yet computed are `None`.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseTrace {
    pub timestamp_ms: i64,
    pub evaluation_id: Uuid,
    pub phase: EvaluationPhase,
    pub samples: usize,
    pub generation_failures: usize,
    pub stability: Option<f64>,
    pub difficulty: Option<f64>,
    pub verification: Option<f64>,
    pub reliability: Option<f64>,
    /// Policy-chosen k, once decided.
    pub target_samples: Option<usize>,
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
    fn record(&self, event: PhaseTrace) -> Result<(), TraceError>;
}

/// Writes one JSON object per line from a background thread.
#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<PhaseTrace>,
}

/// Owns the writer thread. Join after dropping every sink clone to flush.
pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<usize, TraceError>>>,
}

impl TraceWorker {
    /// Number of events written.
    pub fn join(mut self) -> Result<usize, TraceError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(0),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<PhaseTrace>();
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
    fn record(&self, event: PhaseTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<PhaseTrace>,
) -> Result<usize, TraceError> {
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
