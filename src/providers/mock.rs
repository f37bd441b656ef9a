/*!
 * Mock backend implementations for testing.
 *
 * `MockBackend` simulates different behaviors:
 * - `MockBackend::working()` - Always succeeds with a tagged translation
 * - `MockBehavior::FailFirst` - Transient failures before succeeding
 * - `MockBehavior::OmitPositions` - Batch answers silently drop some lines
 * - `MockBehavior::FailChunksContaining` - Batches holding some lines error out
 * - `MockBehavior::Failing` - Always fails with a permanent error
 */

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{BatchItem, TranslationBackend};
use crate::errors::ProviderError;

/// Behavior mode for the mock backend
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Always succeeds
    Working,
    /// Fails with a transient error for the first `failures` calls
    FailFirst { failures: usize },
    /// Batch responses never contain these positions
    OmitPositions(Vec<usize>),
    /// Batch calls containing any of these positions fail
    FailChunksContaining(Vec<usize>),
    /// Always fails with an authentication error
    Failing,
    /// Answers with payment required
    PaymentRequired,
    /// Succeeds after a delay
    Slow { delay_ms: u64 },
}

/// Scripted backend for tests and dry runs
#[derive(Debug)]
pub struct MockBackend {
    behavior: MockBehavior,
    batch_capable: bool,
    calls: AtomicUsize,
    batch_calls: Mutex<Vec<Vec<usize>>>,
}

impl MockBackend {
    /// Create a mock with the specified behavior
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            batch_capable: true,
            calls: AtomicUsize::new(0),
            batch_calls: Mutex::new(Vec::new()),
        }
    }

    /// A mock that always succeeds
    pub fn working() -> Self {
        Self::new(MockBehavior::Working)
    }

    /// Disable batch support, forcing line-by-line translation
    pub fn without_batch(mut self) -> Self {
        self.batch_capable = false;
        self
    }

    /// Calls made so far, single and batch
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Positions sent in each batch call, in call order
    pub fn batch_calls(&self) -> Vec<Vec<usize>> {
        self.batch_calls.lock().clone()
    }

    /// The translation every successful call produces
    pub fn translated(text: &str, target_language: &str) -> String {
        format!("[{}] {}", target_language, text)
    }

    /// Shared gate run at the start of every call
    async fn check(&self) -> Result<(), ProviderError> {
        let count = self.calls.fetch_add(1, Ordering::SeqCst);

        match &self.behavior {
            MockBehavior::FailFirst { failures } if count < *failures => Err(
                ProviderError::ConnectionError(format!("simulated outage (call {})", count + 1)),
            ),
            MockBehavior::Failing => Err(ProviderError::AuthenticationError("invalid key".to_string())),
            MockBehavior::PaymentRequired => Err(ProviderError::ApiError {
                status_code: 402,
                message: "payment required".to_string(),
            }),
            MockBehavior::Slow { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TranslationBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn translate(
        &self,
        text: &str,
        _source_language: &str,
        target_language: &str,
        _context_before: &[String],
        _context_after: &[String],
    ) -> Result<String, ProviderError> {
        self.check().await?;
        Ok(Self::translated(text, target_language))
    }

    fn supports_batch(&self) -> bool {
        self.batch_capable
    }

    async fn translate_batch(
        &self,
        items: &[BatchItem],
        _source_language: &str,
        target_language: &str,
        _pre_context: &[String],
        _post_context: &[String],
    ) -> Result<HashMap<usize, String>, ProviderError> {
        if !self.batch_capable {
            return Err(ProviderError::BatchUnsupported);
        }

        self.batch_calls
            .lock()
            .push(items.iter().map(|item| item.position).collect());
        self.check().await?;

        if let MockBehavior::FailChunksContaining(positions) = &self.behavior {
            if items.iter().any(|item| positions.contains(&item.position)) {
                return Err(ProviderError::ApiError {
                    status_code: 500,
                    message: "simulated batch failure".to_string(),
                });
            }
        }

        let omitted: &[usize] = match &self.behavior {
            MockBehavior::OmitPositions(positions) => positions,
            _ => &[],
        };

        Ok(items
            .iter()
            .filter(|item| !omitted.contains(&item.position))
            .map(|item| (item.position, Self::translated(&item.text, target_language)))
            .collect())
    }
}
