/*!
 * Translation of subtitle requests.
 *
 * - `batch`: graduated chunk splitting around backend batch calls
 * - `repair`: deferred, context-aware repair of lines batches gave up on
 * - `formatting`: markup detection, removal and rewrapping
 * - `job`: per-request orchestration run by the worker pool
 */

use log::Level;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::database::NewLogEntry;

pub mod batch;
pub mod formatting;
pub mod job;
pub mod repair;

pub use self::batch::BatchTranslator;
pub use self::job::{JobServices, TranslationJob};
pub use self::repair::{build_contextual_repair_batch, execute_repair, ContextualRepairBatch, RepairItem};

/// One captured line of a job's diagnostic trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
}

/// Collects a job's log lines for the request log, mirroring each to `log`
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    request_id: Option<i64>,
}

impl LogCapture {
    /// A capture not tied to a request
    pub fn new() -> Self {
        Self::default()
    }

    /// A capture whose mirrored lines name `request_id`
    pub fn for_request(request_id: i64) -> Self {
        Self {
            entries: Arc::default(),
            request_id: Some(request_id),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(Level::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(Level::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(Level::Error, message.into());
    }

    fn push(&self, level: Level, message: String) {
        match self.request_id {
            Some(id) => log::log!(level, "Request {}: {}", id, message),
            None => log::log!(level, "{}", message),
        }
        self.entries.lock().push(LogEntry {
            level: level.as_str().to_lowercase(),
            message,
        });
    }

    /// Snapshot of the captured lines
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Number of captured lines
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Take every captured line, ready to persist
    pub fn drain(&self) -> Vec<NewLogEntry> {
        self.entries
            .lock()
            .drain(..)
            .map(|entry| NewLogEntry {
                level: entry.level,
                message: entry.message,
                details: None,
            })
            .collect()
    }
}
