/*!
 * # yastq - Yet Another Subtitle Translation Queue
 *
 * A persistent job queue that translates video subtitles with an AI backend.
 *
 * ## Features
 *
 * - Durable request queue in SQLite with deduplication of active work
 * - Priority-aware admission to the translation backend with a live limit
 * - Cooperative cancellation of queued and running requests
 * - Batch translation with graduated splitting and deferred repair
 * - Extraction of embedded subtitles through ffmpeg
 * - Per-request diagnostic logs, progress reporting and statistics
 *
 * ## Architecture
 *
 * The library is organized in these main modules:
 * - `app_config`: Configuration file, runtime settings and setting keys
 * - `database`: SQLite persistence of requests, logs, media and settings
 * - `requests`: Request creation, cancellation, retry and priority refresh
 * - `scheduler`: Cancellation registry, concurrency limiter and worker pool
 * - `translation`: Per-request orchestration:
 *   - `translation::batch`: Graduated splitting of failed batches
 *   - `translation::repair`: Deferred repair with merged context windows
 *   - `translation::formatting`: Markup handling and rewrapping
 *   - `translation::job`: The job run by the worker pool
 * - `providers`: Translation backends and their retry/quota decorators
 * - `subtitle_processor`: SRT parsing, validation and output paths
 * - `extraction`: Embedded subtitle discovery and extraction
 * - `media`: Media translation state and effective priority
 * - `progress`: Progress persistence and broadcasting
 * - `language_utils`: ISO language code utilities
 * - `errors`: Custom error types for the application
 *
 * ## License
 *
 * This project is licensed under the MIT License
 */

// Global lints configuration
// These lints will be allowed but not auto-fixed
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]

// Public modules
pub mod app_config;
pub mod database;
pub mod errors;
pub mod extraction;
pub mod language_utils;
pub mod media;
pub mod progress;
pub mod providers;
pub mod requests;
pub mod scheduler;
pub mod subtitle_processor;
pub mod translation;

// Re-export main types for easier usage
pub use app_config::Config;
pub use database::Repository;
pub use errors::{ProviderError, QueueError, SubtitleError, TranslationError};
pub use language_utils::{get_language_name, language_codes_match, normalize_to_part2t};
pub use requests::{CreateOutcome, RequestManager, RequestParams};
pub use scheduler::{CancellationRegistry, ConcurrencyLimiter, WorkerPool};
pub use subtitle_processor::SubtitleEntry;
pub use translation::{JobServices, TranslationJob};
