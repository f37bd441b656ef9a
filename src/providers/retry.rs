/*!
 * Retry decorator for translation backends.
 *
 * Transient failures (rate limiting, 5xx, connection problems) are retried
 * with exponential backoff plus jitter; anything else is returned at once.
 */

use async_trait::async_trait;
use log::warn;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{BatchItem, TranslationBackend};
use crate::errors::ProviderError;

/// Wraps a backend and retries transient errors
#[derive(Debug)]
pub struct RetryingBackend {
    inner: Arc<dyn TranslationBackend>,
    /// Retries after the first attempt
    max_retries: u32,
    /// Delay before the first retry, doubled for each further retry
    base_backoff: Duration,
}

impl RetryingBackend {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn TranslationBackend>, max_retries: u32, base_backoff: Duration) -> Self {
        Self { inner, max_retries, base_backoff }
    }

    /// Backoff before retry number `attempt` (1-based)
    fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self.base_backoff.saturating_mul(1 << (attempt - 1).min(16));
        let jitter_ceiling = (self.base_backoff.as_millis() as u64 / 4).max(1);
        let jitter = rand::rng().random_range(0..jitter_ceiling);
        exponential + Duration::from_millis(jitter)
    }

    async fn with_retries<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ProviderError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} {} failed ({}), retry {}/{} in {:?}",
                        self.inner.name(),
                        operation,
                        e,
                        attempt,
                        self.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl TranslationBackend for RetryingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
        context_before: &[String],
        context_after: &[String],
    ) -> Result<String, ProviderError> {
        self.with_retries("translate", move || {
            self.inner
                .translate(text, source_language, target_language, context_before, context_after)
        })
        .await
    }

    fn supports_batch(&self) -> bool {
        self.inner.supports_batch()
    }

    async fn translate_batch(
        &self,
        items: &[BatchItem],
        source_language: &str,
        target_language: &str,
        pre_context: &[String],
        post_context: &[String],
    ) -> Result<HashMap<usize, String>, ProviderError> {
        self.with_retries("batch", move || {
            self.inner
                .translate_batch(items, source_language, target_language, pre_context, post_context)
        })
        .await
    }
}
