/*!
 * Job scheduling and concurrency control.
 *
 * - `cancellation`: per-request cooperative cancellation tokens
 * - `limiter`: bounded, priority-aware admission to the translation backend
 * - `worker_pool`: claims queued requests and runs them
 */

pub mod cancellation;
pub mod limiter;
pub mod worker_pool;

pub use self::cancellation::{CancellationRegistry, Registration};
pub use self::limiter::{ConcurrencyLimiter, LimiterStats, SlotGuard};
pub use self::worker_pool::{JobExecutor, JobOutcome, PoolOptions, PoolReport, WorkerPool};
