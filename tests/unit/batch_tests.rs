/*!
 * Tests for graduated batch splitting
 */

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use yastq::errors::{ProviderError, TranslationError};
use yastq::providers::{BatchItem, MockBackend, MockBehavior};
use yastq::translation::batch::split_into_chunks;
use yastq::translation::{BatchTranslator, LogCapture};

fn items(texts: &[&str]) -> Vec<BatchItem> {
    texts.iter().enumerate().map(|(i, t)| BatchItem::new(i, *t)).collect()
}

/// Test the chunk sizes produced at each split level
#[test]
fn test_split_into_chunks_withRemainder_shouldFrontLoadChunks() {
    let all: Vec<BatchItem> = (0..7).map(|i| BatchItem::new(i, format!("Line {}", i))).collect();

    let sizes = |parts| split_into_chunks(&all, parts).iter().map(|c| c.len()).collect::<Vec<_>>();
    assert_eq!(sizes(1), vec![7]);
    assert_eq!(sizes(2), vec![4, 3]);
    assert_eq!(sizes(3), vec![3, 3, 1]);
    assert_eq!(sizes(10), vec![1; 7]);
    assert!(split_into_chunks(&[], 3).is_empty());
}

/// Test that markup-only lines never reach the backend
#[tokio::test]
async fn test_translateWithFallback_markupOnlyLines_shouldBeSkipped() {
    let backend = Arc::new(MockBackend::working());
    let translator = BatchTranslator::new(backend.clone(), "en", "fr", 2);
    let batch = items(&["Hello", "{\\an8}", "<i></i>", "World"]);

    let translated = translator
        .translate_with_fallback(&batch, &[], &[], &CancellationToken::new(), &LogCapture::new())
        .await
        .unwrap();

    assert_eq!(translated.keys().copied().collect::<Vec<_>>(), vec![0, 3]);
    assert_eq!(backend.batch_calls(), vec![vec![0, 3]]);
}

/// Test that a backend without batch support is driven line by line
#[tokio::test]
async fn test_translateWithFallback_withoutBatchSupport_shouldTranslateEachLine() {
    let backend = Arc::new(MockBackend::working().without_batch());
    let translator = BatchTranslator::new(backend.clone(), "en", "de", 3);
    let batch = items(&["One", "Two", "Three"]);

    let translated = translator
        .translate_with_fallback(&batch, &[], &[], &CancellationToken::new(), &LogCapture::new())
        .await
        .unwrap();

    assert_eq!(translated[&1], "[de] Two");
    assert_eq!(backend.call_count(), 3);
    assert!(backend.batch_calls().is_empty());
}

/// Test that permanent backend errors abort instead of splitting further
#[tokio::test]
async fn test_translateWithFallback_authenticationError_shouldAbortImmediately() {
    let backend = Arc::new(MockBackend::new(MockBehavior::Failing));
    let translator = BatchTranslator::new(backend.clone(), "en", "fr", 3);
    let batch = items(&["One", "Two", "Three", "Four"]);

    let err = translator
        .translate_with_fallback(&batch, &[], &[], &CancellationToken::new(), &LogCapture::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TranslationError::Provider(ProviderError::AuthenticationError(_))));
    assert_eq!(backend.batch_calls().len(), 1);
}

/// Test that a cancelled token stops work before any backend call
#[tokio::test]
async fn test_translateWithFallback_cancelledToken_shouldNotCallBackend() {
    let backend = Arc::new(MockBackend::working());
    let translator = BatchTranslator::new(backend.clone(), "en", "fr", 3);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = translator
        .translate_with_fallback(&items(&["One"]), &[], &[], &cancel, &LogCapture::new())
        .await;

    assert!(matches!(result, Err(TranslationError::Cancelled)));
    assert_eq!(backend.call_count(), 0);
}

/// Test that one bad line is isolated while its neighbours succeed
#[tokio::test]
async fn test_translateWithFallback_persistentBadLine_shouldIsolateIt() {
    let backend = Arc::new(MockBackend::new(MockBehavior::FailChunksContaining(vec![5])));
    let translator = BatchTranslator::new(backend, "en", "fr", 4);
    let batch: Vec<BatchItem> = (0..8).map(|i| BatchItem::new(i, format!("Line {}", i))).collect();
    let log = LogCapture::new();

    let err = translator
        .translate_with_fallback(&batch, &[], &[], &CancellationToken::new(), &log)
        .await
        .unwrap_err();

    match err {
        TranslationError::BatchExhausted { failed_count, failed_positions, translated } => {
            assert_eq!(failed_count, 1);
            assert_eq!(failed_positions, vec![5usize]);
            assert_eq!(translated.len(), 7);
            assert!(!translated.contains_key(&5));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(log.entries().iter().any(|e| e.level == "warn"));
}
