/*!
 * Database entity models and DTOs.
 *
 * These structures map directly to database tables and provide
 * type-safe access to persisted data.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a translation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker
    InProgress,
    /// Translated and written out
    Completed,
    /// Unrecoverable error occurred
    Failed,
    /// Cancelled by a user or a policy gate
    Cancelled,
    /// Stopped administratively
    Interrupted,
}

impl RequestStatus {
    /// Whether this status ends the request's lifecycle
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending | RequestStatus::InProgress)
    }

    /// Value stored in the `is_active` column (NULL once terminal)
    pub fn active_flag(&self) -> Option<bool> {
        if self.is_terminal() { None } else { Some(true) }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::InProgress => write!(f, "in_progress"),
            RequestStatus::Completed => write!(f, "completed"),
            RequestStatus::Failed => write!(f, "failed"),
            RequestStatus::Cancelled => write!(f, "cancelled"),
            RequestStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "in_progress" => Ok(RequestStatus::InProgress),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            "cancelled" => Ok(RequestStatus::Cancelled),
            "interrupted" => Ok(RequestStatus::Interrupted),
            _ => Err(anyhow::anyhow!("Invalid request status: {}", s)),
        }
    }
}

/// Kind of media a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// A movie file
    Movie,
    /// A single episode of a show
    Episode,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Movie => write!(f, "movie"),
            MediaType::Episode => write!(f, "episode"),
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "movie" => Ok(MediaType::Movie),
            "episode" => Ok(MediaType::Episode),
            _ => Err(anyhow::anyhow!("Invalid media type: {}", s)),
        }
    }
}

/// Denormalized translation state of a media item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaState {
    /// Nothing requested yet and targets missing
    NotStarted,
    /// At least one request is queued
    Pending,
    /// At least one request is running
    InProgress,
    /// Every configured target language has a subtitle
    Complete,
    /// Targets missing and the last attempt failed
    Failed,
}

impl fmt::Display for MediaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaState::NotStarted => write!(f, "not_started"),
            MediaState::Pending => write!(f, "pending"),
            MediaState::InProgress => write!(f, "in_progress"),
            MediaState::Complete => write!(f, "complete"),
            MediaState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for MediaState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_started" => Ok(MediaState::NotStarted),
            "pending" => Ok(MediaState::Pending),
            "in_progress" => Ok(MediaState::InProgress),
            "complete" => Ok(MediaState::Complete),
            "failed" => Ok(MediaState::Failed),
            _ => Err(anyhow::anyhow!("Invalid media state: {}", s)),
        }
    }
}

/// A unit of translation work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRequestRecord {
    /// Row id
    pub id: i64,
    /// Media id (None for ad-hoc content)
    pub media_id: Option<i64>,
    /// Media type (None for ad-hoc content)
    pub media_type: Option<MediaType>,
    /// Display title
    pub title: String,
    /// Source language code
    pub source_language: String,
    /// Target language code
    pub target_language: String,
    /// Subtitle to translate; None means "extract embedded"
    pub subtitle_path: Option<String>,
    /// Current status
    pub status: RequestStatus,
    /// Denormalized media priority flag
    pub is_priority: bool,
    /// Some(true) while queued or running, None once terminal
    pub is_active: Option<bool>,
    /// Creation timestamp (RFC 3339)
    pub created_at: String,
    /// Completion timestamp (RFC 3339)
    pub completed_at: Option<String>,
    /// Progress percentage 0..=100
    pub progress: i64,
    /// Identifier of the execution that owns the request
    pub job_id: Option<String>,
}

impl TranslationRequestRecord {
    /// Media reference as a pair, when both parts are present
    pub fn media_ref(&self) -> Option<(i64, MediaType)> {
        match (self.media_id, self.media_type) {
            (Some(id), Some(kind)) => Some((id, kind)),
            _ => None,
        }
    }
}

/// Parameters for inserting a new request
#[derive(Debug, Clone)]
pub struct NewTranslationRequest {
    /// Media id (None for ad-hoc content)
    pub media_id: Option<i64>,
    /// Media type (None for ad-hoc content)
    pub media_type: Option<MediaType>,
    /// Display title
    pub title: String,
    /// Source language code
    pub source_language: String,
    /// Target language code
    pub target_language: String,
    /// Subtitle to translate; None means "extract embedded"
    pub subtitle_path: Option<String>,
    /// Effective priority at creation time
    pub is_priority: bool,
}

/// One line of a request's diagnostic trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogRecord {
    /// Row id
    pub id: i64,
    /// Owning request
    pub request_id: i64,
    /// Log level (info, warn, error)
    pub level: String,
    /// Message text
    pub message: String,
    /// Optional detail (error chain, stack of causes)
    pub details: Option<String>,
    /// Timestamp (RFC 3339)
    pub created_at: String,
}

/// A media item tracked for translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    /// Row id
    pub id: i64,
    /// Movie or episode
    pub media_type: MediaType,
    /// Display title
    pub title: String,
    /// Path of the video file
    pub path: String,
    /// Whether requests for this media jump the queue
    pub is_priority: bool,
    /// Cached hash of the source subtitle content
    pub content_hash: Option<String>,
    /// Denormalized completion state
    pub translation_state: MediaState,
}

/// Aggregated translation statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    /// Completed translation jobs
    pub total_files: i64,
    /// Subtitle lines translated
    pub total_lines: i64,
    /// Source characters translated
    pub total_characters: i64,
}
