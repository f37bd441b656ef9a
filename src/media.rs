/*!
 * Media-level state: effective priority, content hashing and the
 * denormalized translation state of a media item.
 */

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use sha2::{Digest, Sha256};

use crate::app_config::{keys, LanguageSetting, SettingsProvider};
use crate::database::models::{MediaRecord, MediaState, MediaType, RequestStatus};
use crate::database::Repository;
use crate::language_utils;
use crate::subtitle_processor;

/// Whether work for this media jumps the queue
///
/// Every caller that needs a request's priority (creation, retry, refresh,
/// limiter admission) goes through here. Ad-hoc requests have no media and
/// are never priority.
pub fn effective_priority(media: Option<&MediaRecord>) -> bool {
    media.is_some_and(|m| m.is_priority)
}

/// SHA-256 of subtitle content, hex encoded
pub fn content_hash(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Recomputes and stores the translation state of media items
#[async_trait]
pub trait MediaStateService: Send + Sync {
    /// Recompute the state from requests and subtitles on disk, then persist it
    ///
    /// Never creates requests, so calling it repeatedly is harmless.
    async fn update_state(&self, media_id: i64, media_type: MediaType) -> Result<MediaState>;

    /// Forget the cached source hash so the media is picked up again
    async fn clear_content_hash(&self, media_id: i64, media_type: MediaType) -> Result<()>;

    /// Remember the hash of the source subtitle that was translated
    async fn set_content_hash(&self, media_id: i64, media_type: MediaType, hash: String) -> Result<()>;
}

/// Media state backed by the repository
pub struct RepositoryMediaState {
    repo: Repository,
    settings: Arc<dyn SettingsProvider>,
}

impl RepositoryMediaState {
    /// Create the service
    pub fn new(repo: Repository, settings: Arc<dyn SettingsProvider>) -> Self {
        Self { repo, settings }
    }

    /// Target languages that already have a subtitle next to the media file
    fn languages_on_disk(path: &Path) -> HashSet<String> {
        subtitle_processor::discover_subtitles(path)
            .into_iter()
            .filter_map(|s| s.language)
            .filter_map(|lang| language_utils::normalize_to_part2t(&lang).ok())
            .collect()
    }
}

#[async_trait]
impl MediaStateService for RepositoryMediaState {
    async fn update_state(&self, media_id: i64, media_type: MediaType) -> Result<MediaState> {
        let Some(media) = self.repo.get_media(media_id, media_type).await? else {
            debug!("Media {} {} no longer exists, skipping state update", media_type, media_id);
            return Ok(MediaState::NotStarted);
        };

        let requests = self.repo.requests_for_media(media_id, media_type).await?;
        let targets: Vec<LanguageSetting> =
            self.settings.get_setting_as_json(keys::TARGET_LANGUAGES).await?;

        let on_disk = Self::languages_on_disk(Path::new(&media.path));
        let all_targets_present = !targets.is_empty()
            && targets.iter().all(|t| {
                language_utils::normalize_to_part2t(&t.code)
                    .map(|code| on_disk.contains(&code))
                    .unwrap_or(false)
            });

        // requests_for_media is ordered oldest first
        let last_terminal = requests.iter().rev().find(|r| r.status.is_terminal());

        let state = if requests.iter().any(|r| r.status == RequestStatus::InProgress) {
            MediaState::InProgress
        } else if requests.iter().any(|r| r.status == RequestStatus::Pending) {
            MediaState::Pending
        } else if all_targets_present {
            MediaState::Complete
        } else if targets.is_empty() && last_terminal.is_some_and(|r| r.status == RequestStatus::Completed) {
            MediaState::Complete
        } else if last_terminal.is_some_and(|r| r.status == RequestStatus::Failed) {
            MediaState::Failed
        } else {
            MediaState::NotStarted
        };

        if state != media.translation_state {
            debug!(
                "Media {} {} state {} -> {}",
                media_type, media_id, media.translation_state, state
            );
        }
        self.repo.set_media_state(media_id, media_type, state).await?;
        Ok(state)
    }

    async fn clear_content_hash(&self, media_id: i64, media_type: MediaType) -> Result<()> {
        self.repo.set_content_hash(media_id, media_type, None).await
    }

    async fn set_content_hash(&self, media_id: i64, media_type: MediaType, hash: String) -> Result<()> {
        self.repo.set_content_hash(media_id, media_type, Some(hash)).await
    }
}
