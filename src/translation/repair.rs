/*!
 * Deferred repair of lines that batch translation could not recover.
 *
 * Failures are collected over the whole job and repaired once at the end.
 * Each failed position pulls in `radius` neighbours on both sides; the
 * windows are merged so shared context is sent only once.
 */

use log::info;
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;

use super::batch::BatchTranslator;
use super::LogCapture;
use crate::errors::TranslationError;
use crate::providers::BatchItem;

/// How many failed lines a `RepairFailed` error quotes
const MAX_EXAMPLES: usize = 3;

/// A line that batch translation gave up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairItem {
    /// Position in the subtitle
    pub position: usize,
    /// Source text
    pub original_text: String,
    /// Batch the line was sent in
    pub batch_index: usize,
}

/// Failed lines plus the merged context around them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextualRepairBatch {
    /// Positions that need a translation
    pub failed: BTreeMap<usize, RepairItem>,
    /// Disjoint inclusive ranges, sorted by start
    pub ranges: Vec<(usize, usize)>,
    /// Every item covered by the ranges, in position order
    pub items: Vec<BatchItem>,
}

impl ContextualRepairBatch {
    /// Whether there is nothing to repair
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Merge `[p - radius, p + radius]` windows into disjoint ranges
///
/// Windows are clamped to `0..=last_position`; ranges that overlap or touch
/// are merged.
pub fn merge_context_ranges(
    positions: impl IntoIterator<Item = usize>,
    radius: usize,
    last_position: usize,
) -> Vec<(usize, usize)> {
    let mut windows: Vec<(usize, usize)> = positions
        .into_iter()
        .filter(|&p| p <= last_position)
        .map(|p| (p.saturating_sub(radius), (p + radius).min(last_position)))
        .collect();
    windows.sort_unstable();

    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(windows.len());
    for (start, end) in windows {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end + 1 => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Build the repair batch for `failed` out of `all_items`
pub fn build_contextual_repair_batch(
    failed: &[RepairItem],
    all_items: &[BatchItem],
    context_radius: usize,
) -> ContextualRepairBatch {
    let failed: BTreeMap<usize, RepairItem> = failed
        .iter()
        .map(|item| (item.position, item.clone()))
        .collect();

    let Some(last_position) = all_items.iter().map(|item| item.position).max() else {
        return ContextualRepairBatch { failed, ranges: Vec::new(), items: Vec::new() };
    };

    let ranges = merge_context_ranges(failed.keys().copied(), context_radius, last_position);

    let mut seen = BTreeSet::new();
    let mut items: Vec<BatchItem> = all_items
        .iter()
        .filter(|item| ranges.iter().any(|&(s, e)| (s..=e).contains(&item.position)))
        .filter(|item| seen.insert(item.position))
        .cloned()
        .collect();
    items.sort_by_key(|item| item.position);

    ContextualRepairBatch { failed, ranges, items }
}

/// Translate the failed positions of `batch`
///
/// The batch is cut into chunks of at most `max_batch_size` items, each run
/// through graduated splitting. Context items are translated along with the
/// failed ones but only failed positions are adopted. Passes repeat up to
/// `max_retries + 1` times for positions still missing; anything left after
/// that is `TranslationError::RepairFailed`.
pub async fn execute_repair(
    batch: &ContextualRepairBatch,
    translator: &BatchTranslator,
    max_batch_size: usize,
    max_retries: usize,
    cancel: &CancellationToken,
    log: &LogCapture,
) -> Result<BTreeMap<usize, String>, TranslationError> {
    let mut repaired = BTreeMap::new();
    let mut missing: BTreeSet<usize> = batch.failed.keys().copied().collect();
    let max_batch_size = max_batch_size.max(1);

    log.info(format!(
        "Repairing {} line(s) with {} item(s) of context in {} range(s)",
        missing.len(),
        batch.items.len().saturating_sub(missing.len()),
        batch.ranges.len()
    ));

    for pass in 1..=max_retries + 1 {
        if missing.is_empty() {
            break;
        }

        for chunk in batch.items.chunks(max_batch_size) {
            if !chunk.iter().any(|item| missing.contains(&item.position)) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled);
            }

            let translated = match translator
                .translate_with_fallback(chunk, &[], &[], cancel, log)
                .await
            {
                Ok(translated) => translated,
                Err(TranslationError::BatchExhausted { translated, .. }) => translated,
                Err(e) => return Err(e),
            };

            for (position, text) in translated {
                if missing.remove(&position) {
                    repaired.insert(position, text);
                }
            }
        }

        if !missing.is_empty() {
            log.warn(format!(
                "Repair pass {} left {} line(s) untranslated",
                pass,
                missing.len()
            ));
        }
    }

    if missing.is_empty() {
        info!("Deferred repair recovered {} line(s)", repaired.len());
        return Ok(repaired);
    }

    let examples: Vec<String> = missing
        .iter()
        .filter_map(|p| batch.failed.get(p))
        .take(MAX_EXAMPLES)
        .map(|item| item.original_text.clone())
        .collect();
    log.error(format!("Repair failed for {} line(s)", missing.len()));

    Err(TranslationError::RepairFailed {
        failed_count: missing.len(),
        examples,
    })
}
