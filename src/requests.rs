/*!
 * Request lifecycle operations outside the worker pool.
 *
 * Creation deduplicates against active requests and wakes the pool; cancel,
 * retry and removal enforce the status rules of the queue. Priority always
 * comes from `media::effective_priority`.
 */

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::app_config::{keys, LanguageSetting, SettingsProvider};
use crate::database::models::{
    MediaRecord, MediaType, NewTranslationRequest, RequestLogRecord, RequestStatus,
    TranslationRequestRecord,
};
use crate::database::{InsertOutcome, NewLogEntry, Repository};
use crate::errors::QueueError;
use crate::language_utils;
use crate::media::{self, MediaStateService};
use crate::progress::ProgressSink;
use crate::scheduler::CancellationRegistry;
use crate::subtitle_processor::discover_subtitles;

/// Result of `create_request`: a new row, or the active one that already covers the work
pub type CreateOutcome = InsertOutcome;

/// What to translate
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    /// Media the subtitle belongs to; None for ad-hoc files
    pub media: Option<(i64, MediaType)>,
    /// Display title; defaults to the media title
    pub title: String,
    pub source_language: String,
    pub target_language: String,
    /// Subtitle to translate; None extracts the embedded track
    pub subtitle_path: Option<String>,
}

/// Creates and manages translation requests
pub struct RequestManager {
    repo: Repository,
    settings: Arc<dyn SettingsProvider>,
    cancellations: Arc<CancellationRegistry>,
    media_state: Arc<dyn MediaStateService>,
    progress: Arc<dyn ProgressSink>,
    waker: Arc<Notify>,
}

impl RequestManager {
    pub fn new(
        repo: Repository,
        settings: Arc<dyn SettingsProvider>,
        cancellations: Arc<CancellationRegistry>,
        media_state: Arc<dyn MediaStateService>,
        progress: Arc<dyn ProgressSink>,
        waker: Arc<Notify>,
    ) -> Self {
        Self {
            repo,
            settings,
            cancellations,
            media_state,
            progress,
            waker,
        }
    }

    async fn existing_request(&self, request_id: i64) -> Result<TranslationRequestRecord> {
        self.repo
            .get_request(request_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(request_id).into())
    }

    async fn media_for(&self, media: Option<(i64, MediaType)>) -> Result<Option<MediaRecord>> {
        let Some((media_id, media_type)) = media else {
            return Ok(None);
        };
        match self.repo.get_media(media_id, media_type).await? {
            Some(record) => Ok(Some(record)),
            None => Err(QueueError::InvalidRequest(format!("{} {} does not exist", media_type, media_id)).into()),
        }
    }

    async fn refresh_media_state(&self, media: Option<(i64, MediaType)>) {
        if let Some((media_id, media_type)) = media {
            if let Err(e) = self.media_state.update_state(media_id, media_type).await {
                warn!("Failed to update the state of {} {}: {:#}", media_type, media_id, e);
            }
        }
    }

    /// Queue a translation unless an active request already covers it
    pub async fn create_request(&self, params: RequestParams) -> Result<CreateOutcome> {
        let source_language = language_utils::validate_language_code(&params.source_language)
            .map_err(|e| QueueError::InvalidRequest(e.to_string()))?;
        let target_language = language_utils::validate_language_code(&params.target_language)
            .map_err(|e| QueueError::InvalidRequest(e.to_string()))?;
        if language_utils::language_codes_match(&source_language, &target_language) {
            return Err(QueueError::InvalidRequest(format!(
                "Source and target language are both {}",
                source_language
            ))
            .into());
        }
        if params.media.is_none() && params.subtitle_path.is_none() {
            return Err(QueueError::InvalidRequest("An ad-hoc request needs a subtitle file".to_string()).into());
        }

        let media = self.media_for(params.media).await?;
        let title = match (&media, params.title.trim()) {
            (Some(media), "") => media.title.clone(),
            (_, title) => title.to_string(),
        };

        let outcome = self
            .repo
            .insert_request(&NewTranslationRequest {
                media_id: params.media.map(|(id, _)| id),
                media_type: params.media.map(|(_, kind)| kind),
                title,
                source_language,
                target_language,
                subtitle_path: params.subtitle_path,
                is_priority: media::effective_priority(media.as_ref()),
            })
            .await?;

        match outcome {
            InsertOutcome::Created(id) => {
                info!("Queued translation request {}", id);
                self.waker.notify_one();
            }
            InsertOutcome::Existing(id) => debug!("Reusing active translation request {}", id),
        }
        self.refresh_media_state(params.media).await;

        Ok(outcome)
    }

    /// Cancel a request
    ///
    /// Pending requests are cancelled directly; running ones are signalled
    /// and finish as cancelled at their next checkpoint. Returns whether
    /// anything was cancelled.
    pub async fn cancel_request(&self, request_id: i64) -> Result<bool> {
        let request = self.existing_request(request_id).await?;

        match request.status {
            RequestStatus::Pending => {
                let cancelled = self.repo.finish_request(request_id, RequestStatus::Cancelled).await?;
                // The pool may have claimed it in the meantime
                self.cancellations.cancel(request_id);
                if cancelled {
                    self.repo
                        .append_logs(
                            request_id,
                            vec![NewLogEntry {
                                level: "info".to_string(),
                                message: "Cancelled before it started".to_string(),
                                details: None,
                            }],
                        )
                        .await?;
                    self.progress.emit_status(request_id, RequestStatus::Cancelled).await;
                    self.refresh_media_state(request.media_ref()).await;
                }
                Ok(cancelled)
            }
            RequestStatus::InProgress => Ok(self.cancellations.cancel(request_id)),
            _ => Ok(false),
        }
    }

    /// Queue a terminal request again
    ///
    /// The old row is replaced by a fresh pending one. When an active
    /// request already covers the same work the old row is still removed
    /// and the active one is returned.
    pub async fn retry_request(&self, request_id: i64) -> Result<CreateOutcome> {
        let request = self.existing_request(request_id).await?;
        if !request.status.is_terminal() {
            return Err(QueueError::InvalidTransition {
                request_id,
                from: request.status.to_string(),
                to: RequestStatus::Pending.to_string(),
            }
            .into());
        }

        let media = self.media_for(request.media_ref()).await?;
        let outcome = self
            .repo
            .insert_request(&NewTranslationRequest {
                media_id: request.media_id,
                media_type: request.media_type,
                title: request.title.clone(),
                source_language: request.source_language.clone(),
                target_language: request.target_language.clone(),
                subtitle_path: request.subtitle_path.clone(),
                is_priority: media::effective_priority(media.as_ref()),
            })
            .await?;

        self.repo
            .delete_request(request_id)
            .await
            .with_context(|| format!("Failed to remove request {} after retrying it", request_id))?;
        info!("Request {} retried as {}", request_id, outcome.id());

        self.waker.notify_one();
        self.refresh_media_state(request.media_ref()).await;
        Ok(outcome)
    }

    /// Retry every failed request; returns how many new requests were queued
    pub async fn retry_failed_requests(&self) -> Result<usize> {
        let failed = self.repo.list_requests(Some(RequestStatus::Failed)).await?;
        let mut queued = 0;

        for request in failed {
            match self.retry_request(request.id).await {
                Ok(InsertOutcome::Created(_)) => queued += 1,
                Ok(InsertOutcome::Existing(_)) => {}
                Err(e) => warn!("Could not retry request {}: {:#}", request.id, e),
            }
        }

        if queued > 0 {
            info!("Retry sweep queued {} request(s)", queued);
        }
        Ok(queued)
    }

    /// Re-read the media priority into its active requests and wake the pool
    pub async fn refresh_priority(&self, media_id: i64, media_type: MediaType) -> Result<usize> {
        let media = self.repo.get_media(media_id, media_type).await?;
        let is_priority = media::effective_priority(media.as_ref());
        let updated = self
            .repo
            .update_request_priority(media_id, media_type, is_priority)
            .await?;

        debug!(
            "{} {} priority is now {}; {} active request(s) updated",
            media_type, media_id, is_priority, updated
        );
        self.waker.notify_one();
        Ok(updated)
    }

    /// Flag a media item as priority (or not) and propagate it
    pub async fn set_media_priority(&self, media_id: i64, media_type: MediaType, is_priority: bool) -> Result<usize> {
        if !self.repo.set_media_priority(media_id, media_type, is_priority).await? {
            return Err(QueueError::InvalidRequest(format!("{} {} does not exist", media_type, media_id)).into());
        }
        self.refresh_priority(media_id, media_type).await
    }

    /// Delete a finished request and its log
    pub async fn remove_request(&self, request_id: i64) -> Result<bool> {
        let request = self.existing_request(request_id).await?;
        if !request.status.is_terminal() {
            return Err(QueueError::InvalidRequest(format!(
                "Request {} is {}; cancel it before removing it",
                request_id, request.status
            ))
            .into());
        }
        self.repo.delete_request(request_id).await
    }

    /// Diagnostic trail of a request, oldest first
    pub async fn request_logs(&self, request_id: i64) -> Result<Vec<RequestLogRecord>> {
        self.existing_request(request_id).await?;
        self.repo.get_logs(request_id).await
    }

    /// Queue requests for configured target languages that have no subtitle yet
    ///
    /// An external subtitle in a configured source language is used when
    /// present; otherwise the job extracts the embedded track.
    pub async fn queue_missing_translations(&self, media_id: i64, media_type: MediaType) -> Result<Vec<CreateOutcome>> {
        let Some(media) = self.repo.get_media(media_id, media_type).await? else {
            return Err(QueueError::InvalidRequest(format!("{} {} does not exist", media_type, media_id)).into());
        };

        let targets: Vec<LanguageSetting> = self.settings.get_setting_as_json(keys::TARGET_LANGUAGES).await?;
        let sources: Vec<LanguageSetting> = self.settings.get_setting_as_json(keys::SOURCE_LANGUAGES).await?;
        let Some(default_source) = sources.first() else {
            return Err(QueueError::InvalidRequest("No source languages are configured".to_string()).into());
        };

        let discovered = discover_subtitles(Path::new(&media.path));
        let on_disk: HashSet<String> = discovered
            .iter()
            .filter_map(|s| s.language.as_deref())
            .filter_map(|lang| language_utils::normalize_to_part2t(lang).ok())
            .collect();

        // First configured source language with an external file wins
        let external_source = sources.iter().find_map(|source| {
            discovered
                .iter()
                .find(|s| {
                    s.language
                        .as_deref()
                        .is_some_and(|lang| language_utils::language_codes_match(lang, &source.code))
                })
                .map(|s| (source.code.clone(), s.path.to_string_lossy().into_owned()))
        });
        let (source_language, subtitle_path) = match external_source {
            Some((code, path)) => (code, Some(path)),
            None => (default_source.code.clone(), None),
        };

        let mut outcomes = Vec::new();
        for target in &targets {
            let present = language_utils::normalize_to_part2t(&target.code)
                .map(|code| on_disk.contains(&code))
                .unwrap_or(false);
            if present || language_utils::language_codes_match(&target.code, &source_language) {
                continue;
            }

            let outcome = self
                .create_request(RequestParams {
                    media: Some((media_id, media_type)),
                    title: media.title.clone(),
                    source_language: source_language.clone(),
                    target_language: target.code.clone(),
                    subtitle_path: subtitle_path.clone(),
                })
                .await?;
            outcomes.push(outcome);
        }

        self.refresh_media_state(Some((media_id, media_type))).await;
        Ok(outcomes)
    }
}
