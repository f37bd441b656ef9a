/*!
 * Batch translation with graduated splitting.
 *
 * A batch is first sent whole. Items that come back missing or blank, or
 * that sat in a chunk the backend rejected, are re-split into more and more
 * chunks (level L uses L chunks) until everything is translated or the
 * split budget runs out. Items without meaningful content are never sent.
 */

use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::formatting::has_meaningful_content;
use super::LogCapture;
use crate::errors::{ProviderError, TranslationError};
use crate::providers::{BatchItem, TranslationBackend};

/// Errors that splitting cannot fix
fn aborts_batch(error: &ProviderError) -> bool {
    matches!(
        error,
        ProviderError::AuthenticationError(_)
            | ProviderError::PaymentRequired(_)
            | ProviderError::QuotaExceeded { .. }
    )
}

/// Split `items` into `parts` chunks of `ceil(len / parts)` items
///
/// Leading chunks absorb the remainder, so fewer than `parts` chunks come
/// back when there are not enough items.
pub fn split_into_chunks(items: &[BatchItem], parts: usize) -> Vec<&[BatchItem]> {
    if items.is_empty() {
        return Vec::new();
    }
    let chunk_size = items.len().div_ceil(parts.max(1));
    items.chunks(chunk_size).collect()
}

/// Translates batches for one language pair, splitting on failure
pub struct BatchTranslator {
    backend: Arc<dyn TranslationBackend>,
    source_language: String,
    target_language: String,
    max_split_attempts: usize,
}

impl BatchTranslator {
    /// Create a translator; `max_split_attempts` is clamped to at least one
    pub fn new(
        backend: Arc<dyn TranslationBackend>,
        source_language: impl Into<String>,
        target_language: impl Into<String>,
        max_split_attempts: usize,
    ) -> Self {
        Self {
            backend,
            source_language: source_language.into(),
            target_language: target_language.into(),
            max_split_attempts: max_split_attempts.max(1),
        }
    }

    /// Translate `items`, returning translations keyed by position
    ///
    /// Skipped items (no meaningful content) are absent from the result.
    /// When the split budget is spent with items still untranslated the
    /// error is `TranslationError::BatchExhausted`, which carries what did
    /// succeed so callers can keep it.
    pub async fn translate_with_fallback(
        &self,
        items: &[BatchItem],
        pre_context: &[String],
        post_context: &[String],
        cancel: &CancellationToken,
        log: &LogCapture,
    ) -> Result<BTreeMap<usize, String>, TranslationError> {
        let mut translated = BTreeMap::new();
        let mut pending: Vec<BatchItem> = items
            .iter()
            .filter(|item| has_meaningful_content(&item.text))
            .cloned()
            .collect();

        let skipped = items.len() - pending.len();
        if skipped > 0 {
            debug!("Skipping {} item(s) without translatable content", skipped);
        }

        for level in 1..=self.max_split_attempts {
            if pending.is_empty() {
                break;
            }

            let mut failed = Vec::new();
            for chunk in split_into_chunks(&pending, level) {
                if cancel.is_cancelled() {
                    return Err(TranslationError::Cancelled);
                }

                match self.call_chunk(chunk, pre_context, post_context, cancel).await {
                    Ok(response) => {
                        for item in chunk {
                            match response.get(&item.position) {
                                Some(text) if !text.trim().is_empty() => {
                                    translated.insert(item.position, text.clone());
                                }
                                _ => failed.push(item.clone()),
                            }
                        }
                    }
                    Err(TranslationError::Provider(e)) if !aborts_batch(&e) => {
                        debug!(
                            "Chunk of {} item(s) failed at split level {}: {}",
                            chunk.len(),
                            level,
                            e
                        );
                        failed.extend(chunk.iter().cloned());
                    }
                    Err(e) => return Err(e),
                }
            }

            if !failed.is_empty() && level < self.max_split_attempts {
                log.warn(format!(
                    "{} item(s) untranslated at split level {}, retrying in {} chunk(s)",
                    failed.len(),
                    level,
                    (level + 1).min(failed.len())
                ));
            }
            pending = failed;
        }

        if pending.is_empty() {
            return Ok(translated);
        }

        let failed_positions: Vec<usize> = pending.iter().map(|item| item.position).collect();
        log.warn(format!(
            "{} item(s) still untranslated after {} split level(s): positions {:?}",
            failed_positions.len(),
            self.max_split_attempts,
            failed_positions
        ));

        Err(TranslationError::BatchExhausted {
            failed_count: failed_positions.len(),
            failed_positions,
            translated,
        })
    }

    /// One backend call for a chunk; line-by-line when batches are unsupported
    async fn call_chunk(
        &self,
        chunk: &[BatchItem],
        pre_context: &[String],
        post_context: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashMap<usize, String>, TranslationError> {
        if self.backend.supports_batch() {
            let call = self.backend.translate_batch(
                chunk,
                &self.source_language,
                &self.target_language,
                pre_context,
                post_context,
            );
            return tokio::select! {
                _ = cancel.cancelled() => Err(TranslationError::Cancelled),
                result = call => result.map_err(TranslationError::from),
            };
        }

        let mut response = HashMap::with_capacity(chunk.len());
        for item in chunk {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled);
            }
            let call = self.backend.translate(
                &item.text,
                &self.source_language,
                &self.target_language,
                pre_context,
                post_context,
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(TranslationError::Cancelled),
                result = call => result,
            };
            match result {
                Ok(text) => {
                    response.insert(item.position, text);
                }
                Err(e) if aborts_batch(&e) => return Err(e.into()),
                Err(e) => debug!("Line {} failed: {}", item.position, e),
            }
        }
        Ok(response)
    }
}
