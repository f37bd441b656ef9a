/*!
 * Worker pool driving the persistent request queue.
 *
 * One coordinating loop claims pending requests (priority first, then
 * oldest) and runs each as its own task, up to `max_workers` at a time.
 * The loop sleeps on a wake signal with a short timeout while work is
 * running and a longer one while idle.
 *
 * Guarantees:
 * - requests stranded in progress by a crash are re-queued on startup
 * - an execution that errors or panics before recording a result is forced
 *   to `Failed` with a log entry explaining why
 * - on shutdown, executions that do not finish in time are abandoned and
 *   their requests reset to pending
 */

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::app_config::{keys, parse_usize, SchedulerConfig, SettingsProvider};
use crate::database::models::{RequestStatus, TranslationRequestRecord};
use crate::database::{NewLogEntry, Repository};
use crate::errors::QueueError;

/// Worker count when the setting is missing
const DEFAULT_MAX_WORKERS: usize = 4;

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
    /// The request vanished or belongs to another execution; nothing was done
    Skipped,
}

/// Runs one claimed request to a terminal state
///
/// Returning `Err` means the executor could not record a result itself;
/// the pool then marks the request failed.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, request: TranslationRequestRecord, job_id: String) -> Result<JobOutcome>;
}

/// Pool timing
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub active_poll_interval: Duration,
    pub idle_poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub max_claim_attempts: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for PoolOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            active_poll_interval: Duration::from_millis(config.active_poll_interval_ms),
            idle_poll_interval: Duration::from_millis(config.idle_poll_interval_ms),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            max_claim_attempts: config.max_claim_attempts,
        }
    }
}

/// Counters collected over one `run`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub recovered: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    /// Executions cut off by shutdown and handed back to the queue
    pub abandoned: usize,
}

impl PoolReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Cancelled => self.cancelled += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }
}

type Finished = (i64, Result<JobOutcome>);

/// Claims queued requests and runs them concurrently
pub struct WorkerPool {
    repo: Repository,
    settings: Arc<dyn SettingsProvider>,
    executor: Arc<dyn JobExecutor>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    options: PoolOptions,
}

impl WorkerPool {
    /// Create a pool
    pub fn new(
        repo: Repository,
        settings: Arc<dyn SettingsProvider>,
        executor: Arc<dyn JobExecutor>,
        options: PoolOptions,
    ) -> Self {
        Self {
            repo,
            settings,
            executor,
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            options,
        }
    }

    /// Signal that wakes the loop early (new work, priority change)
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Stop claiming and drain; `run` returns once draining is done
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token that stops the pool when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn max_workers(&self) -> usize {
        match self.settings.get_setting(keys::MAX_WORKERS).await {
            Ok(value) => parse_usize(value.as_ref(), DEFAULT_MAX_WORKERS).max(1),
            Err(e) => {
                warn!("Failed to read {}: {}", keys::MAX_WORKERS, e);
                DEFAULT_MAX_WORKERS
            }
        }
    }

    /// Run until `shutdown` is called
    pub async fn run(&self) -> Result<PoolReport> {
        let mut report = PoolReport {
            recovered: self.repo.reset_in_progress_requests().await?,
            ..PoolReport::default()
        };

        let mut running: JoinSet<Finished> = JoinSet::new();
        let mut in_flight: HashSet<i64> = HashSet::new();
        info!("Worker pool started");

        while !self.shutdown.is_cancelled() {
            while let Some(joined) = running.try_join_next() {
                self.handle_finished(joined, &mut in_flight, &mut report).await;
            }

            let max_workers = self.max_workers().await;
            while in_flight.len() < max_workers && !self.shutdown.is_cancelled() {
                let job_id = uuid::Uuid::new_v4().to_string();
                match self.repo.claim_next(&job_id, self.options.max_claim_attempts).await {
                    Ok(Some(request)) => {
                        debug!("Starting request {} as job {}", request.id, job_id);
                        in_flight.insert(request.id);
                        self.spawn_execution(&mut running, request, job_id);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to claim the next request: {:#}", e);
                        break;
                    }
                }
            }

            let timeout = if in_flight.is_empty() {
                self.options.idle_poll_interval
            } else {
                self.options.active_poll_interval
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    self.handle_finished(joined, &mut in_flight, &mut report).await;
                }
                _ = tokio::time::sleep(timeout) => {}
            }
        }

        self.drain(running, in_flight, &mut report).await;
        info!(
            "Worker pool stopped: {} completed, {} failed, {} cancelled, {} abandoned",
            report.completed, report.failed, report.cancelled, report.abandoned
        );
        Ok(report)
    }

    fn spawn_execution(
        &self,
        running: &mut JoinSet<Finished>,
        request: TranslationRequestRecord,
        job_id: String,
    ) {
        let executor = Arc::clone(&self.executor);
        let request_id = request.id;

        running.spawn(async move {
            let result = AssertUnwindSafe(executor.execute(request, job_id))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(anyhow!("Execution panicked: {}", panic_message(&*panic))));
            (request_id, result)
        });
    }

    async fn handle_finished(
        &self,
        joined: Result<Finished, tokio::task::JoinError>,
        in_flight: &mut HashSet<i64>,
        report: &mut PoolReport,
    ) {
        let (request_id, result) = match joined {
            Ok(finished) => finished,
            // Only aborts end up here; panics are caught inside the task
            Err(e) => {
                debug!("Execution task ended without a result: {}", e);
                return;
            }
        };
        in_flight.remove(&request_id);

        match result {
            Ok(outcome) => {
                debug!("Request {} finished: {:?}", request_id, outcome);
                report.record(outcome);
            }
            Err(e) => {
                error!("Request {} execution failed: {:#}", request_id, e);
                self.force_failed(request_id, &e).await;
                report.record(JobOutcome::Failed);
            }
        }
    }

    /// Mark a request failed after its execution escaped with an error
    async fn force_failed(&self, request_id: i64, cause: &anyhow::Error) {
        match self.repo.finish_request(request_id, RequestStatus::Failed).await {
            Ok(changed) => {
                if !changed {
                    debug!("Request {} already finished before the failure was recorded", request_id);
                }
                let entry = NewLogEntry {
                    level: "error".to_string(),
                    message: format!("Execution failed before a result was recorded: {}", cause),
                    details: Some(format!("{:#}", cause)),
                };
                if let Err(e) = self.repo.append_logs(request_id, vec![entry]).await {
                    error!("Failed to write failure log for request {}: {:#}", request_id, e);
                }
            }
            Err(e) if matches!(e.downcast_ref::<QueueError>(), Some(QueueError::NotFound(_))) => {
                debug!("Request {} was deleted while running", request_id);
            }
            Err(e) => error!("Failed to mark request {} as failed: {:#}", request_id, e),
        }
    }

    /// Wait for running executions, then hand back whatever is left
    async fn drain(&self, mut running: JoinSet<Finished>, mut in_flight: HashSet<i64>, report: &mut PoolReport) {
        if running.is_empty() {
            return;
        }
        info!(
            "Waiting up to {:?} for {} running job(s)",
            self.options.shutdown_timeout,
            running.len()
        );

        let deadline = tokio::time::Instant::now() + self.options.shutdown_timeout;
        loop {
            match tokio::time::timeout_at(deadline, running.join_next()).await {
                Ok(Some(joined)) => self.handle_finished(joined, &mut in_flight, report).await,
                Ok(None) => break,
                Err(_) => break,
            }
        }

        running.abort_all();
        while running.join_next().await.is_some() {}

        for request_id in in_flight {
            match self.repo.reset_to_pending(request_id).await {
                Ok(true) => {
                    warn!("Request {} did not finish before shutdown, returned to the queue", request_id);
                    report.abandoned += 1;
                }
                Ok(false) => debug!("Request {} reached a final state during shutdown", request_id),
                Err(e) => error!("Failed to re-queue request {}: {:#}", request_id, e),
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
