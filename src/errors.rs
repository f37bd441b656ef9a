/*!
 * Error types for the yastq application.
 *
 * This module contains custom error types for different parts of the application,
 * using the thiserror crate for ergonomic error definitions.
 */

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors that can occur when calling a translation backend
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Error when making an API request fails
    #[error("API request failed: {0}")]
    RequestFailed(String),

    /// Error when parsing an API response fails
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Error returned by the API itself
    #[error("API responded with error: {status_code} - {message}")]
    ApiError {
        /// HTTP status code
        status_code: u16,
        /// Error message from the API
        message: String,
    },

    /// Error establishing or maintaining a connection
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error related to rate limiting
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Error with authentication
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// The account ran out of credit; calls are paused until the given time
    #[error("Payment required, backend paused until {0}")]
    PaymentRequired(String),

    /// Local usage quota exhausted
    #[error("Usage quota exceeded: {used} of {limit} characters")]
    QuotaExceeded {
        /// Characters consumed so far
        used: u64,
        /// Configured character limit
        limit: u64,
    },

    /// The backend returned nothing for a non-empty input
    #[error("Backend returned an empty translation")]
    EmptyResponse,

    /// The backend cannot translate batches
    #[error("Backend does not support batch translation")]
    BatchUnsupported,
}

impl ProviderError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RequestFailed(_)
            | ProviderError::ConnectionError(_)
            | ProviderError::RateLimitExceeded(_)
            | ProviderError::EmptyResponse => true,
            ProviderError::ApiError { status_code, .. } => {
                *status_code == 429 || *status_code >= 500
            }
            _ => false,
        }
    }
}

/// Errors that can occur while processing subtitle files
#[derive(Error, Debug)]
pub enum SubtitleError {
    /// The subtitle file could not be found
    #[error("Subtitle file not found: {0}")]
    NotFound(String),

    /// The file failed the configured quality gate
    #[error("Subtitle validation failed: {0}")]
    Invalid(String),

    /// No embedded subtitle stream could be extracted
    #[error("Embedded subtitle extraction failed: {0}")]
    ExtractionFailed(String),
}

/// Errors that can occur during translation
#[derive(Error, Debug)]
pub enum TranslationError {
    /// Error from the provider API
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Error with subtitle processing
    #[error("Subtitle error: {0}")]
    Subtitle(#[from] SubtitleError),

    /// The job's cancellation token fired
    #[error("Translation was cancelled")]
    Cancelled,

    /// Graduated splitting ran out of attempts with items still untranslated
    #[error("Batch translation failed for {failed_count} item(s) after splitting")]
    BatchExhausted {
        /// Number of items that never received a translation
        failed_count: usize,
        /// Positions of those items
        failed_positions: Vec<usize>,
        /// Translations that did succeed, keyed by position
        translated: BTreeMap<usize, String>,
    },

    /// The subtitle failed the configured quality gate
    #[error("Subtitle rejected by validation: {0}")]
    Validation(String),

    /// Deferred repair left positions untranslated
    #[error("Repair failed for {failed_count} line(s): {}", examples.join(" | "))]
    RepairFailed {
        /// Number of positions still missing
        failed_count: usize,
        /// A few of the original texts, for the request log
        examples: Vec<String>,
    },
}

/// Errors raised by the persistent request queue
#[derive(Error, Debug)]
pub enum QueueError {
    /// The request row does not exist (deleted mid-flight)
    #[error("Translation request {0} not found")]
    NotFound(i64),

    /// A finished request was claimed again by a different execution
    #[error("Translation request {request_id} is already {status}; refusing to resume it as job {job_id}")]
    StaleExecution {
        /// Request id
        request_id: i64,
        /// Current terminal status
        status: String,
        /// Job identifier of the stale execution
        job_id: String,
    },

    /// The requested state change is not allowed from the current state
    #[error("Cannot move request {request_id} from {from} to {to}")]
    InvalidTransition {
        /// Request id
        request_id: i64,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Invalid request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
