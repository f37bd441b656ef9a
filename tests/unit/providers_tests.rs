/*!
 * Tests for the backend decorators working together
 */

use std::sync::Arc;
use std::time::Duration;

use yastq::app_config::{BackendKind, ProviderConfig};
use yastq::errors::ProviderError;
use yastq::providers::{
    build_backend, decode_batch, encode_batch, BatchItem, MockBackend, MockBehavior, QuotaBackend,
    RetryingBackend, TranslationBackend, UsageMeter,
};

/// Test that transient failures are retried below the quota meter
#[tokio::test(start_paused = true)]
async fn test_decorators_transientFailures_shouldMeterOnlyTheSuccess() {
    let mock = Arc::new(MockBackend::new(MockBehavior::FailFirst { failures: 2 }));
    let retrying = Arc::new(RetryingBackend::new(mock.clone(), 3, Duration::from_millis(100)));
    let meter = Arc::new(UsageMeter::new(Some(100), Duration::from_secs(60)));
    let backend = QuotaBackend::new(retrying, meter.clone());

    let translated = backend.translate("Hello", "en", "fr", &[], &[]).await.unwrap();

    assert_eq!(translated, "[fr] Hello");
    assert_eq!(mock.call_count(), 3);
    assert_eq!(meter.used(), 5);
}

/// Test that a payment-required answer is surfaced as such and not retried
#[tokio::test(start_paused = true)]
async fn test_decorators_paymentRequired_shouldPauseWithoutRetrying() {
    let mock = Arc::new(MockBackend::new(MockBehavior::PaymentRequired));
    let retrying = Arc::new(RetryingBackend::new(mock.clone(), 3, Duration::from_millis(100)));
    let meter = Arc::new(UsageMeter::new(None, Duration::from_secs(60)));
    let backend = QuotaBackend::new(retrying, meter.clone());

    let items = vec![BatchItem::new(0, "Hello")];
    let err = backend.translate_batch(&items, "en", "fr", &[], &[]).await.unwrap_err();

    assert!(matches!(err, ProviderError::PaymentRequired(_)));
    assert_eq!(mock.call_count(), 1);
    assert!(meter.is_paused());
}

/// Test that the mock backend kind builds a working decorated stack
#[tokio::test]
async fn test_build_backend_withMockKind_shouldTranslate() {
    let config = ProviderConfig {
        kind: BackendKind::Mock,
        ..ProviderConfig::default()
    };

    let (backend, meter) = build_backend(&config);
    let items = vec![BatchItem::new(3, "Bye")];
    let translated = backend.translate_batch(&items, "en", "es", &[], &[]).await.unwrap();

    assert_eq!(translated[&3], "[es] Bye");
    assert_eq!(meter.used(), 3);
    assert!(backend.supports_batch());
}

/// Test that the batch wire format keeps positions through a round trip
#[test]
fn test_batch_protocol_withMultilineText_shouldPreservePositions() {
    let items = vec![BatchItem::new(4, "First\nline"), BatchItem::new(9, "Second")];
    let encoded = encode_batch(&items, &["Before".to_string()], &[]);

    let decoded = decode_batch(&encoded, &items);

    assert_eq!(decoded[&4], "First\nline");
    assert_eq!(decoded[&9], "Second");
    assert!(!decoded.values().any(|text| text.contains("Before")));
}
