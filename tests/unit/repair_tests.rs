/*!
 * Tests for deferred repair
 */

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use yastq::errors::TranslationError;
use yastq::providers::{BatchItem, MockBackend, MockBehavior};
use yastq::translation::repair::merge_context_ranges;
use yastq::translation::{build_contextual_repair_batch, execute_repair, BatchTranslator, LogCapture, RepairItem};

fn all_items(count: usize) -> Vec<BatchItem> {
    (0..count).map(|i| BatchItem::new(i, format!("Line {}", i))).collect()
}

fn failed(positions: &[usize]) -> Vec<RepairItem> {
    positions
        .iter()
        .map(|&position| RepairItem {
            position,
            original_text: format!("Line {}", position),
            batch_index: position / 10,
        })
        .collect()
}

/// Test that ranges come back disjoint and sorted whatever the input order
#[test]
fn test_merge_context_ranges_withUnsortedPositions_shouldReturnDisjointSortedRanges() {
    let ranges = merge_context_ranges([40, 2, 12, 3, 11], 1, 45);

    assert_eq!(ranges, vec![(1, 4), (10, 13), (39, 41)]);
    assert!(ranges.windows(2).all(|w| w[0].1 + 1 < w[1].0));
}

/// Test failures spread over several original batches
#[test]
fn test_build_contextual_repair_batch_acrossBatches_shouldMergeSharedContext() {
    let items = all_items(30);
    let batch = build_contextual_repair_batch(&failed(&[9, 10, 25]), &items, 2);

    assert_eq!(batch.ranges, vec![(7, 12), (23, 27)]);
    assert_eq!(batch.items.len(), 11);
    assert!(batch.failed.contains_key(&10));
}

/// Test that an empty failure list produces nothing to repair
#[test]
fn test_build_contextual_repair_batch_withoutFailures_shouldBeEmpty() {
    let batch = build_contextual_repair_batch(&[], &all_items(5), 3);

    assert!(batch.is_empty());
    assert!(batch.items.is_empty());
}

/// Test that repair chunks respect the batch size and skip chunks with only context
#[tokio::test]
async fn test_execute_repair_withSmallBatchSize_shouldOnlySendChunksWithFailures() {
    let backend = Arc::new(MockBackend::working());
    let translator = BatchTranslator::new(backend.clone(), "en", "fr", 1);
    let batch = build_contextual_repair_batch(&failed(&[2]), &all_items(10), 4);

    let repaired = execute_repair(&batch, &translator, 3, 0, &CancellationToken::new(), &LogCapture::new())
        .await
        .unwrap();

    // Items 0..=6 in chunks [0,1,2] [3,4,5] [6]; only the first holds a failure
    assert_eq!(backend.batch_calls(), vec![vec![0, 1, 2]]);
    assert_eq!(repaired.len(), 1);
    assert_eq!(repaired[&2], "[fr] Line 2");
}

/// Test that a cancelled token stops repair
#[tokio::test]
async fn test_execute_repair_cancelled_shouldReturnCancelled() {
    let backend = Arc::new(MockBackend::new(MockBehavior::OmitPositions(vec![1])));
    let translator = BatchTranslator::new(backend, "en", "fr", 1);
    let batch = build_contextual_repair_batch(&failed(&[1]), &all_items(4), 1);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = execute_repair(&batch, &translator, 10, 2, &cancel, &LogCapture::new()).await;

    assert!(matches!(result, Err(TranslationError::Cancelled)));
}

/// Test that the failure report quotes at most three lines
#[tokio::test]
async fn test_execute_repair_manyPersistentFailures_shouldQuoteThreeExamples() {
    let positions = vec![1, 4, 7, 10, 13];
    let backend = Arc::new(MockBackend::new(MockBehavior::OmitPositions(positions.clone())));
    let translator = BatchTranslator::new(backend, "en", "fr", 1);
    let batch = build_contextual_repair_batch(&failed(&positions), &all_items(15), 1);

    let err = execute_repair(&batch, &translator, 50, 1, &CancellationToken::new(), &LogCapture::new())
        .await
        .unwrap_err();

    match err {
        TranslationError::RepairFailed { failed_count, examples } => {
            assert_eq!(failed_count, 5);
            assert_eq!(examples, vec!["Line 1", "Line 4", "Line 7"]);
        }
        other => panic!("unexpected error: {other}"),
    }
}
