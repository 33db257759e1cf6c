//! Client-side state of one upload attempt and the progress events it emits.

use crate::limits::CHUNK_SIZE;
use chrono::Utc;
use std::ops::Range;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Where an attempt currently is.
///
/// `Idle → Validating → (SendingFile | SendingChunk(i)… → Completing) → Succeeded | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Idle,
    Validating,
    SendingFile,
    SendingChunk(u64),
    Completing,
    Succeeded,
    Failed,
}

impl UploadPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadPhase::Succeeded | UploadPhase::Failed)
    }
}

/// A snapshot published on every phase transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub phase: UploadPhase,
    pub completed_chunks: u64,
    pub total_chunks: u64,
    /// 0.0 ..= 100.0
    pub percent: f64,
}

pub type ProgressSender = UnboundedSender<ProgressEvent>;

/// Generate a fresh upload identifier: `upload_<millis>_<9 random chars>`.
pub fn new_upload_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("upload_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

/// Number of chunks needed for `size` bytes.
pub fn total_chunks(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size)
}

/// Byte range of chunk `index`.
pub fn chunk_range(index: u64, chunk_size: u64, size: u64) -> Range<u64> {
    let start = index * chunk_size;
    start..((index + 1) * chunk_size).min(size)
}

/// The chunk plan of one attempt.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    pub filename: String,
    pub size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub current_chunk_index: u64,
}

impl UploadSession {
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            upload_id: new_upload_id(),
            filename: filename.into(),
            size,
            chunk_size: CHUNK_SIZE,
            total_chunks: total_chunks(size, CHUNK_SIZE),
            current_chunk_index: 0,
        }
    }

    pub fn chunk_range(&self, index: u64) -> Range<u64> {
        chunk_range(index, self.chunk_size, self.size)
    }
}

/// Tracks the phase of an attempt and publishes transitions.
///
/// Send failures are ignored: a caller that stops listening never changes
/// what the upload does.
#[derive(Debug)]
pub struct ProgressTracker {
    phase: UploadPhase,
    completed_chunks: u64,
    total_chunks: u64,
    percent: f64,
    sender: Option<ProgressSender>,
}

impl ProgressTracker {
    pub fn new(sender: Option<ProgressSender>) -> Self {
        Self {
            phase: UploadPhase::Idle,
            completed_chunks: 0,
            total_chunks: 0,
            percent: 0.0,
            sender,
        }
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    pub fn validating(&mut self) {
        self.transition(UploadPhase::Validating, 0, 0, 0.0);
    }

    pub fn sending_file(&mut self) {
        self.transition(UploadPhase::SendingFile, 0, 0, 0.0);
    }

    /// Entering chunk `index`; `index` chunks are already acknowledged.
    pub fn sending_chunk(&mut self, index: u64, total: u64) {
        let percent = 90.0 * index as f64 / total as f64;
        self.transition(UploadPhase::SendingChunk(index), index, total, percent);
    }

    pub fn completing(&mut self, total: u64) {
        self.transition(UploadPhase::Completing, total, total, 90.0);
    }

    pub fn succeeded(&mut self) {
        let total = self.total_chunks;
        self.transition(UploadPhase::Succeeded, total, total, 100.0);
    }

    /// Terminal failure: counters and percent go back to zero.
    pub fn failed(&mut self) {
        self.transition(UploadPhase::Failed, 0, 0, 0.0);
    }

    fn transition(&mut self, phase: UploadPhase, completed: u64, total: u64, percent: f64) {
        self.phase = phase;
        self.completed_chunks = completed;
        self.total_chunks = total;
        self.percent = percent;
        if let Some(sender) = &self.sender {
            let _ = sender.send(ProgressEvent {
                phase,
                completed_chunks: completed,
                total_chunks: total,
                percent,
            });
        }
    }
}
