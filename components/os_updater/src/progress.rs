//! Progress adapters
//!
//! The package cache reports raw fetch and install callbacks through a
//! [`ProgressSink`]. A [`ProgressReporter`] turns them into normalized
//! [`ProgressEvent`]s for one operation and writes them into the event
//! channel, which the broadcaster drains.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use updater_protocol::{Envelope, MessageType, ProgressEvent, Status};

pub type EventSender = mpsc::UnboundedSender<Envelope>;
pub type EventReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Channel carrying every envelope the orchestrator emits, in emission order
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Raw download progress as reported by the package manager
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchProgress {
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub current_items: u64,
    pub total_items: u64,
    pub description: String,
}

impl FetchProgress {
    /// `100 * (bytes + items done) / (bytes + items total)`, 0 when there is
    /// nothing to fetch
    pub fn percent(&self) -> f64 {
        let done = self.current_bytes.saturating_add(self.current_items) as f64;
        let total = self.total_bytes.saturating_add(self.total_items) as f64;
        if total == 0.0 {
            return 0.0;
        }
        (100.0 * done / total).clamp(0.0, 100.0)
    }
}

/// Raw install progress as reported by the package manager
#[derive(Debug, Clone, PartialEq)]
pub enum InstallProgress {
    Status { percent: f64, description: String },
    Failed { package: String, message: String },
}

pub trait ProgressSink: Send + Sync {
    fn fetch(&self, progress: FetchProgress);
    fn install(&self, progress: InstallProgress);
}

/// Sink that drops everything
pub struct NullSink;

impl ProgressSink for NullSink {
    fn fetch(&self, _progress: FetchProgress) {}
    fn install(&self, _progress: InstallProgress) {}
}

/// Emits the events of one operation under a fixed message type
///
/// Percent never goes backwards between `start` calls.
pub struct ProgressReporter {
    kind: MessageType,
    tx: EventSender,
    last_percent: Mutex<f64>,
}

impl ProgressReporter {
    pub fn new(kind: MessageType, tx: EventSender) -> Self {
        Self {
            kind,
            tx,
            last_percent: Mutex::new(0.0),
        }
    }

    /// A reporter for the next phase of the same operation, starting at 0
    pub fn next_phase(&self) -> Self {
        Self::new(self.kind, self.tx.clone())
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn start(&self, message: impl Into<String>) {
        *self.last_percent.lock() = 0.0;
        self.emit(Status::Start, 0.0, message.into());
    }

    pub fn status(&self, message: impl Into<String>, percent: f64) {
        let percent = {
            let mut last = self.last_percent.lock();
            let percent = if percent.is_nan() { *last } else { percent.clamp(0.0, 100.0) };
            *last = last.max(percent);
            *last
        };
        self.emit(Status::Status, percent, message.into());
    }

    pub fn finish(&self, message: impl Into<String>) {
        *self.last_percent.lock() = 100.0;
        self.emit(Status::Finish, 100.0, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        let percent = *self.last_percent.lock();
        self.emit(Status::Error, percent, message.into());
    }

    fn emit(&self, status: Status, percent: f64, message: String) {
        tracing::debug!(kind = ?self.kind, ?status, percent, "{}", message);
        let envelope = Envelope::progress(self.kind, ProgressEvent::new(status, percent, message));
        if self.tx.send(envelope).is_err() {
            tracing::debug!("event channel closed, dropping progress event");
        }
    }
}

impl ProgressSink for ProgressReporter {
    fn fetch(&self, progress: FetchProgress) {
        let percent = progress.percent();
        self.status(progress.description, percent);
    }

    fn install(&self, progress: InstallProgress) {
        match progress {
            InstallProgress::Status {
                percent,
                description,
            } => self.status(description, percent),
            InstallProgress::Failed { package, message } => {
                let percent = *self.last_percent.lock();
                self.status(format!("Failed to install {}: {}", package, message), percent);
            }
        }
    }
}
