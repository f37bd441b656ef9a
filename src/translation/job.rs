/*!
 * Per-request translation orchestration.
 *
 * A job confirms ownership of its request, waits for a limiter slot, loads
 * the source subtitle (falling back to embedded extraction), applies the
 * validation gate, translates line by line or in batches, post-processes,
 * writes the result and records the terminal status. This is the only
 * place that decides between completed, failed and cancelled.
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::batch::BatchTranslator;
use super::formatting::{
    has_meaningful_content, preserve_line_breaks, preserve_position_tags, remove_markup, rewrap,
    strip_formatting,
};
use super::repair::{build_contextual_repair_batch, execute_repair, RepairItem};
use super::LogCapture;
use crate::app_config::{SettingsProvider, TranslationSettings};
use crate::database::models::{MediaRecord, RequestStatus, TranslationRequestRecord};
use crate::database::Repository;
use crate::errors::{QueueError, SubtitleError, TranslationError};
use crate::extraction::{select_track, EmbeddedSubtitleExtractor};
use crate::media::{self, MediaStateService};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::providers::{BatchItem, TranslationBackend};
use crate::scheduler::{CancellationRegistry, ConcurrencyLimiter, JobExecutor, JobOutcome};
use crate::subtitle_processor::{render_srt, SubtitleEntry, SubtitleIo};

/// Progress ceiling while deferred repair may still run
const DEFERRED_PROGRESS_CAP: u8 = 95;

/// Progress ceiling until the output file is written
const TRANSLATED_PROGRESS_CAP: u8 = 99;

/// Directory (under the temp dir) that receives extracted streams
const EXTRACTION_DIRNAME: &str = "yastq/extract";

/// Collaborators a translation job needs
#[derive(Clone)]
pub struct JobServices {
    pub repo: Repository,
    pub settings: Arc<dyn SettingsProvider>,
    pub backend: Arc<dyn TranslationBackend>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub cancellations: Arc<CancellationRegistry>,
    pub subtitles: Arc<dyn SubtitleIo>,
    pub extractor: Arc<dyn EmbeddedSubtitleExtractor>,
    pub progress: Arc<dyn ProgressSink>,
    pub media_state: Arc<dyn MediaStateService>,
}

/// Source subtitle ready for translation
struct LoadedSubtitles {
    entries: Vec<SubtitleEntry>,
    /// File that was parsed
    path: PathBuf,
    /// Path the output names are derived from
    output_base: PathBuf,
    content_hash: String,
    /// Private directory holding an extracted stream; removed once parsed and validated
    extraction_dir: Option<TempDir>,
}

impl LoadedSubtitles {
    fn cleanup(&mut self) {
        if let Some(dir) = self.extraction_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                debug!("Could not remove extraction directory {:?}: {}", path, e);
            }
        }
    }
}

/// What a successful translation produced
struct TranslatedSubtitle {
    output_path: PathBuf,
    content_hash: String,
}

/// Lines before `start` and after `end` (exclusive) used as context
fn context_window(
    texts: &[String],
    start: usize,
    end: usize,
    before: usize,
    after: usize,
) -> (Vec<String>, Vec<String>) {
    let end = end.min(texts.len());
    let pre = texts[start.saturating_sub(before)..start.min(end)].to_vec();
    let post = texts[end..(end + after).min(texts.len())].to_vec();
    (pre, post)
}

/// Runs translation requests; plugged into the worker pool
pub struct TranslationJob {
    services: JobServices,
}

impl TranslationJob {
    pub fn new(services: JobServices) -> Self {
        Self { services }
    }

    async fn load_media(&self, request: &TranslationRequestRecord) -> Result<Option<MediaRecord>> {
        match request.media_ref() {
            Some((media_id, media_type)) => self.services.repo.get_media(media_id, media_type).await,
            None => Ok(None),
        }
    }

    /// Everything between claiming a slot and writing the output
    async fn translate(
        &self,
        request: &TranslationRequestRecord,
        media: Option<&MediaRecord>,
        cancel: &CancellationToken,
        log: &LogCapture,
    ) -> Result<TranslatedSubtitle> {
        let settings = TranslationSettings::resolve(self.services.settings.as_ref()).await?;

        if let Err(e) = self
            .services
            .limiter
            .refresh_from_settings(self.services.settings.as_ref())
            .await
        {
            warn!("Keeping current concurrency limit: {:#}", e);
        }

        // Priority is read now, not at enqueue time
        let is_priority = media::effective_priority(self.load_media(request).await?.as_ref());
        let mut slot = self.services.limiter.acquire(is_priority, cancel).await?;
        debug!("Request {} acquired a translation slot", request.id);

        let mut loaded = self.load_subtitles(request, media, &settings, cancel, log).await?;
        let validation = match &settings.validation {
            Some(options) => self.services.subtitles.validate_subtitle(&loaded.path, options).await,
            None => Ok(()),
        };
        loaded.cleanup();
        validation.map_err(|e| TranslationError::Validation(e.to_string()))?;

        if cancel.is_cancelled() {
            return Err(TranslationError::Cancelled.into());
        }

        let texts: Vec<String> = loaded
            .entries
            .iter()
            .map(|entry| {
                if settings.remove_markup {
                    remove_markup(&entry.text)
                } else {
                    entry.text.clone()
                }
            })
            .collect();
        log.info(format!("Loaded {} subtitle line(s)", texts.len()));

        let batch_mode = settings.use_batch_translation && self.services.backend.supports_batch();
        let translated = if batch_mode {
            self.translate_batches(request, &texts, &settings, cancel, log).await?
        } else {
            self.translate_lines(request, &texts, &settings, cancel, log).await?
        };

        slot.release();

        let mut output = loaded.entries.clone();
        for (position, entry) in output.iter_mut().enumerate() {
            entry.text = match translated.get(&position) {
                Some(text) => preserve_line_breaks(&texts[position], &preserve_position_tags(&entry.text, text)),
                None => texts[position].clone(),
            };
        }
        self.post_process(&mut output, &settings, log);

        let output_path = self
            .write_output(&output, &loaded.output_base, &request.target_language, log)
            .await?;
        self.services.progress.emit(request.id, 100).await;

        let characters: usize = translated.keys().map(|&p| texts[p].chars().count()).sum();
        if let Err(e) = self
            .services
            .repo
            .record_statistics(&request.target_language, translated.len() as i64, characters as i64)
            .await
        {
            warn!("Failed to update statistics: {:#}", e);
        }

        Ok(TranslatedSubtitle {
            output_path,
            content_hash: loaded.content_hash,
        })
    }

    async fn load_subtitles(
        &self,
        request: &TranslationRequestRecord,
        media: Option<&MediaRecord>,
        settings: &TranslationSettings,
        cancel: &CancellationToken,
        log: &LogCapture,
    ) -> Result<LoadedSubtitles> {
        if let Some(path) = request.subtitle_path.as_deref().map(PathBuf::from) {
            match self.services.subtitles.read_subtitles(&path).await {
                Ok(entries) if !entries.is_empty() => {
                    return Ok(LoadedSubtitles {
                        content_hash: media::content_hash(render_srt(&entries).as_bytes()),
                        entries,
                        output_base: path.clone(),
                        path,
                        extraction_dir: None,
                    });
                }
                Ok(_) => log.warn(format!("{} has no subtitle entries", path.display())),
                Err(e) => log.warn(format!("Cannot use {}: {}", path.display(), e)),
            }
        }

        let Some(media) = media else {
            let missing = request.subtitle_path.clone().unwrap_or_else(|| request.title.clone());
            return Err(SubtitleError::NotFound(missing).into());
        };

        log.info("Falling back to embedded subtitles");
        self.extract_embedded(request, media, settings, cancel, log).await
    }

    async fn extract_embedded(
        &self,
        request: &TranslationRequestRecord,
        media: &MediaRecord,
        settings: &TranslationSettings,
        cancel: &CancellationToken,
        log: &LogCapture,
    ) -> Result<LoadedSubtitles> {
        let media_path = Path::new(&media.path);
        // One directory per execution; jobs on the same media extract identical file names
        let base_dir = std::env::temp_dir().join(EXTRACTION_DIRNAME);
        tokio::fs::create_dir_all(&base_dir)
            .await
            .with_context(|| format!("Failed to create extraction directory: {}", base_dir.display()))?;
        let extraction_dir = tempfile::Builder::new()
            .prefix(&format!("request-{}-", request.id))
            .tempdir_in(&base_dir)
            .with_context(|| format!("Failed to create extraction directory in {}", base_dir.display()))?;
        let out_dir = extraction_dir.path().to_path_buf();
        let attempts = settings.max_extraction_retries.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled.into());
            }

            let tracks = match self.services.extractor.sync_embedded_subtitles(media_path).await {
                Ok(tracks) => tracks,
                Err(e) => {
                    last_error = format!("{:#}", e);
                    log.warn(format!("Extraction attempt {}/{} failed: {}", attempt, attempts, last_error));
                    continue;
                }
            };

            let Some(track) = select_track(&tracks, &request.source_language) else {
                last_error = format!("no text subtitle stream in {}", media_path.display());
                break;
            };

            let extracted = self
                .services
                .extractor
                .extract_subtitle(
                    media_path,
                    track.index,
                    &out_dir,
                    &track.codec_name,
                    track.language.as_deref(),
                )
                .await;

            match extracted {
                Ok(Some(path)) => match self.services.subtitles.read_subtitles(&path).await {
                    Ok(entries) if !entries.is_empty() => {
                        log.info(format!("Extracted {} line(s) from stream {}", entries.len(), track.index));
                        return Ok(LoadedSubtitles {
                            content_hash: media::content_hash(render_srt(&entries).as_bytes()),
                            entries,
                            path,
                            output_base: media_path.to_path_buf(),
                            extraction_dir: Some(extraction_dir),
                        });
                    }
                    Ok(_) => last_error = format!("stream {} produced no entries", track.index),
                    Err(e) => last_error = format!("{:#}", e),
                },
                Ok(None) => last_error = format!("stream {} produced no output", track.index),
                Err(e) => last_error = format!("{:#}", e),
            }
            log.warn(format!("Extraction attempt {}/{} failed: {}", attempt, attempts, last_error));
        }

        Err(SubtitleError::ExtractionFailed(last_error).into())
    }

    async fn translate_lines(
        &self,
        request: &TranslationRequestRecord,
        texts: &[String],
        settings: &TranslationSettings,
        cancel: &CancellationToken,
        log: &LogCapture,
    ) -> Result<BTreeMap<usize, String>, TranslationError> {
        let backend = &self.services.backend;
        let mut tracker = ProgressTracker::new(texts.len(), TRANSLATED_PROGRESS_CAP);
        let mut translated = BTreeMap::new();
        log.info("Translating line by line");

        for (position, text) in texts.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled);
            }
            if has_meaningful_content(text) {
                let (before, after) = context_window(
                    texts,
                    position,
                    position + 1,
                    settings.context_lines_before,
                    settings.context_lines_after,
                );
                let call = backend.translate(
                    text,
                    &request.source_language,
                    &request.target_language,
                    &before,
                    &after,
                );
                let result = tokio::select! {
                    _ = cancel.cancelled() => return Err(TranslationError::Cancelled),
                    result = call => result,
                };
                translated.insert(position, result?);
            }

            if let Some(percent) = tracker.advance(position + 1) {
                self.services.progress.emit(request.id, percent).await;
            }
        }

        Ok(translated)
    }

    async fn translate_batches(
        &self,
        request: &TranslationRequestRecord,
        texts: &[String],
        settings: &TranslationSettings,
        cancel: &CancellationToken,
        log: &LogCapture,
    ) -> Result<BTreeMap<usize, String>, TranslationError> {
        let translator = BatchTranslator::new(
            Arc::clone(&self.services.backend),
            request.source_language.clone(),
            request.target_language.clone(),
            settings.max_split_attempts,
        );
        let items: Vec<BatchItem> = texts
            .iter()
            .enumerate()
            .map(|(position, text)| BatchItem::new(position, text.clone()))
            .collect();

        let cap = if settings.use_deferred_repair { DEFERRED_PROGRESS_CAP } else { TRANSLATED_PROGRESS_CAP };
        let mut tracker = ProgressTracker::new(items.len(), cap);
        let mut translated = BTreeMap::new();
        let mut repair_items: Vec<RepairItem> = Vec::new();
        let batch_count = items.len().div_ceil(settings.max_batch_size);
        log.info(format!("Translating in {} batch(es) of up to {}", batch_count, settings.max_batch_size));

        for (batch_index, batch) in items.chunks(settings.max_batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled);
            }

            let start = batch_index * settings.max_batch_size;
            let end = start + batch.len();
            let (pre, post) = if settings.batch_context_enabled {
                context_window(texts, start, end, settings.batch_context_before, settings.batch_context_after)
            } else {
                (Vec::new(), Vec::new())
            };

            match translator.translate_with_fallback(batch, &pre, &post, cancel, log).await {
                Ok(result) => translated.extend(result),
                Err(TranslationError::BatchExhausted {
                    failed_count,
                    failed_positions,
                    translated: partial,
                }) => {
                    translated.extend(partial);
                    if !settings.use_deferred_repair {
                        log.error(format!("Batch {} left {} line(s) untranslated", batch_index + 1, failed_count));
                        return Err(TranslationError::BatchExhausted {
                            failed_count,
                            failed_positions,
                            translated: BTreeMap::new(),
                        });
                    }
                    log.warn(format!(
                        "Batch {} left {} line(s) for deferred repair",
                        batch_index + 1,
                        failed_count
                    ));
                    repair_items.extend(failed_positions.into_iter().map(|position| RepairItem {
                        position,
                        original_text: texts[position].clone(),
                        batch_index,
                    }));
                }
                Err(e) => return Err(e),
            }

            if let Some(percent) = tracker.advance(end) {
                self.services.progress.emit(request.id, percent).await;
            }
        }

        if !repair_items.is_empty() {
            let repair_batch =
                build_contextual_repair_batch(&repair_items, &items, settings.repair_context_radius);
            let repaired = execute_repair(
                &repair_batch,
                &translator,
                settings.max_batch_size,
                settings.repair_max_retries,
                cancel,
                log,
            )
            .await?;
            translated.extend(repaired);
        }

        Ok(translated)
    }

    fn post_process(&self, entries: &mut [SubtitleEntry], settings: &TranslationSettings, log: &LogCapture) {
        if settings.fix_overlaps {
            let fixed = self.services.subtitles.fix_overlaps(entries);
            if fixed > 0 {
                log.info(format!("Fixed {} overlapping subtitle(s)", fixed));
            }
        }
        if settings.max_line_length > 0 {
            for entry in entries.iter_mut() {
                entry.text = rewrap(&entry.text, settings.max_line_length);
            }
        }
        if settings.strip_formatting {
            for entry in entries.iter_mut() {
                entry.text = strip_formatting(&entry.text);
            }
        }
    }

    async fn write_output(
        &self,
        entries: &[SubtitleEntry],
        output_base: &Path,
        target_language: &str,
        log: &LogCapture,
    ) -> Result<PathBuf> {
        let candidates = self.services.subtitles.output_paths(output_base, target_language);

        for candidate in &candidates {
            match self.services.subtitles.write_subtitles(candidate, entries).await {
                Ok(()) => {
                    log.info(format!("Wrote {}", candidate.display()));
                    return Ok(candidate.clone());
                }
                Err(e) => log.warn(format!("Cannot write {}: {:#}", candidate.display(), e)),
            }
        }

        Err(anyhow!(
            "Failed to write the translated subtitle to any of {} location(s)",
            candidates.len()
        ))
    }

    /// Decide the terminal status for a failed run
    fn classify(&self, error: &anyhow::Error, cancel: &CancellationToken, log: &LogCapture) -> RequestStatus {
        match error.downcast_ref::<TranslationError>() {
            Some(TranslationError::Validation(reason)) => {
                log.warn(format!("Subtitle rejected by validation: {}", reason));
                RequestStatus::Cancelled
            }
            Some(TranslationError::Cancelled) => {
                log.info("Translation cancelled");
                RequestStatus::Cancelled
            }
            _ if cancel.is_cancelled() => {
                log.info(format!("Translation cancelled ({})", error));
                RequestStatus::Cancelled
            }
            _ => {
                log.error(format!("Translation failed: {:#}", error));
                RequestStatus::Failed
            }
        }
    }

    /// Record the terminal status, flush the log and update the media
    async fn finalize(
        &self,
        request: &TranslationRequestRecord,
        status: RequestStatus,
        content_hash: Option<String>,
        log: &LogCapture,
    ) -> Result<JobOutcome> {
        let repo = &self.services.repo;

        let recorded = match repo.finish_request(request.id, status).await {
            Ok(recorded) => recorded,
            Err(e) if matches!(e.downcast_ref::<QueueError>(), Some(QueueError::NotFound(_))) => {
                info!("Request {} was deleted while running, dropping its result", request.id);
                return Ok(JobOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        if !recorded {
            log.warn(format!("Request had already finished; {} was not recorded", status));
        }

        self.services.progress.emit_status(request.id, status).await;
        if let Err(e) = repo.append_logs(request.id, log.drain()).await {
            warn!("Failed to store the log of request {}: {:#}", request.id, e);
        }

        if let Some((media_id, media_type)) = request.media_ref() {
            let hash_update = match (status, content_hash) {
                (RequestStatus::Cancelled, _) => self.services.media_state.clear_content_hash(media_id, media_type).await,
                (RequestStatus::Completed, Some(hash)) => {
                    self.services.media_state.set_content_hash(media_id, media_type, hash).await
                }
                _ => Ok(()),
            };
            if let Err(e) = hash_update {
                warn!("Failed to update the content hash of {} {}: {:#}", media_type, media_id, e);
            }
            if let Err(e) = self.services.media_state.update_state(media_id, media_type).await {
                warn!("Failed to update the state of {} {}: {:#}", media_type, media_id, e);
            }
        }

        Ok(match (recorded, status) {
            (false, _) => JobOutcome::Skipped,
            (true, RequestStatus::Completed) => JobOutcome::Completed,
            (true, RequestStatus::Failed) => JobOutcome::Failed,
            (true, _) => JobOutcome::Cancelled,
        })
    }
}

#[async_trait]
impl JobExecutor for TranslationJob {
    async fn execute(&self, request: TranslationRequestRecord, job_id: String) -> Result<JobOutcome> {
        let request_id = request.id;
        let log = LogCapture::for_request(request_id);
        let registration = self.services.cancellations.register_guarded(request_id);
        let cancel = registration.token().clone();

        let request = match self.services.repo.begin_execution(request_id, &job_id).await {
            Ok(request) => request,
            Err(e) => {
                return match e.downcast_ref::<QueueError>() {
                    Some(QueueError::StaleExecution { .. }) => {
                        cancel.cancel();
                        warn!("{}", e);
                        Ok(JobOutcome::Skipped)
                    }
                    Some(QueueError::NotFound(_)) => {
                        info!("Request {} was deleted before it started", request_id);
                        Ok(JobOutcome::Skipped)
                    }
                    _ => Err(e),
                };
            }
        };

        log.info(format!(
            "Translating '{}' from {} to {}",
            request.title, request.source_language, request.target_language
        ));

        let media = self.load_media(&request).await?;
        if request.media_ref().is_some() && media.is_none() {
            log.warn("The media item no longer exists");
            return self.finalize(&request, RequestStatus::Cancelled, None, &log).await;
        }

        let (status, content_hash) = match self.translate(&request, media.as_ref(), &cancel, &log).await {
            Ok(done) => {
                log.info(format!("Translation completed: {}", done.output_path.display()));
                (RequestStatus::Completed, Some(done.content_hash))
            }
            Err(e) => (self.classify(&e, &cancel, &log), None),
        };

        let outcome = self.finalize(&request, status, content_hash, &log).await;
        drop(registration);
        outcome
    }
}
