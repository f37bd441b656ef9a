/*!
 * Progress reporting for translation requests.
 *
 * Progress is persisted with `MAX(progress, ?)` so the stored value never
 * goes backwards, and broadcast to live listeners. Neither path may fail a
 * job: errors are logged and dropped.
 */

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::broadcast;

use crate::database::models::RequestStatus;
use crate::database::Repository;

/// Capacity of the live listener channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event sent to live listeners
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A request's progress changed
    Progress {
        /// Request id
        request_id: i64,
        /// Percentage 0..=100
        percent: u8,
    },
    /// A request changed status
    Status {
        /// Request id
        request_id: i64,
        /// New status
        status: RequestStatus,
    },
}

/// Consumer of progress updates
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Report progress of one request
    async fn emit(&self, request_id: i64, percent: u8);

    /// Report the same progress for several requests
    async fn emit_batch(&self, request_ids: &[i64], percent: u8) {
        futures::future::join_all(request_ids.iter().map(|id| self.emit(*id, percent))).await;
    }

    /// Report a status change
    async fn emit_status(&self, request_id: i64, status: RequestStatus);
}

/// Persists progress and fans it out on a broadcast channel
pub struct ProgressReporter {
    repo: Option<Repository>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressReporter {
    /// Reporter that persists to `repo`
    pub fn new(repo: Repository) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { repo: Some(repo), sender }
    }

    /// Reporter that only broadcasts
    pub fn detached() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { repo: None, sender }
    }

    /// Subscribe to live events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    fn broadcast(&self, event: ProgressEvent) {
        // No listeners is the normal case for the CLI
        if self.sender.send(event).is_err() {
            debug!("No progress listeners attached");
        }
    }
}

#[async_trait]
impl ProgressSink for ProgressReporter {
    async fn emit(&self, request_id: i64, percent: u8) {
        let percent = percent.min(100);

        if let Some(repo) = &self.repo {
            if let Err(e) = repo.update_progress(request_id, percent).await {
                warn!("Failed to persist progress for request {}: {}", request_id, e);
            }
        }

        self.broadcast(ProgressEvent::Progress { request_id, percent });
    }

    async fn emit_status(&self, request_id: i64, status: RequestStatus) {
        self.broadcast(ProgressEvent::Status { request_id, status });
    }
}

/// Turns item counts into a percentage that never decreases
///
/// Jobs keep `cap` below 100 (lower still while deferred repair is pending)
/// and report 100 themselves once the output is written.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: usize,
    cap: u8,
    last: u8,
}

impl ProgressTracker {
    /// Track `total` items with an upper bound of `cap` percent
    pub fn new(total: usize, cap: u8) -> Self {
        Self { total, cap: cap.min(100), last: 0 }
    }

    /// Record `done` finished items; returns the new percentage when it increased
    pub fn advance(&mut self, done: usize) -> Option<u8> {
        let raw = if self.total == 0 {
            100
        } else {
            (done.min(self.total) * 100 / self.total) as u8
        };
        let next = raw.min(self.cap);

        if next > self.last {
            self.last = next;
            Some(next)
        } else {
            None
        }
    }
}
