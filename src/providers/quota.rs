/*!
 * Usage metering decorator.
 *
 * `QuotaBackend` reserves characters on a shared `UsageMeter` before
 * delegating each call and gives them back when the call fails, so
 * concurrent jobs can never overrun the limit together. The meter
 * holds a pause window after the backend answered "payment required", so
 * no further calls are attempted until the window ends.
 */

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{BatchItem, TranslationBackend};
use crate::errors::ProviderError;

#[derive(Debug, Default)]
struct MeterState {
    used: u64,
    paused_until: Option<(Instant, chrono::DateTime<chrono::Utc>)>,
}

/// Process-wide usage accounting for a backend
#[derive(Debug)]
pub struct UsageMeter {
    limit: Option<u64>,
    payment_pause: Duration,
    state: Mutex<MeterState>,
}

impl UsageMeter {
    /// Create a meter; `limit` of None means unmetered
    pub fn new(limit: Option<u64>, payment_pause: Duration) -> Self {
        Self {
            limit,
            payment_pause,
            state: Mutex::new(MeterState::default()),
        }
    }

    /// Reserve `characters`, refusing when paused or when the limit would be exceeded
    ///
    /// The check and the reservation happen under one lock.
    pub fn reserve(&self, characters: u64) -> Result<(), ProviderError> {
        let mut state = self.state.lock();

        if let Some((until, wall_clock)) = state.paused_until {
            if Instant::now() < until {
                return Err(ProviderError::PaymentRequired(wall_clock.to_rfc3339()));
            }
            info!("Payment pause elapsed, resuming backend calls");
            state.paused_until = None;
        }

        if let Some(limit) = self.limit {
            if state.used + characters > limit {
                return Err(ProviderError::QuotaExceeded { used: state.used, limit });
            }
        }

        state.used += characters;
        Ok(())
    }

    /// Return a reservation whose call failed
    pub fn refund(&self, characters: u64) {
        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(characters);
    }

    /// Stop calls for the configured pause window
    pub fn pause_for_payment(&self) {
        let until = Instant::now() + self.payment_pause;
        let wall_clock = chrono::Utc::now()
            + chrono::Duration::from_std(self.payment_pause).unwrap_or_else(|_| chrono::Duration::zero());
        warn!("Backend requires payment, pausing calls for {:?}", self.payment_pause);
        self.state.lock().paused_until = Some((until, wall_clock));
    }

    /// Characters counted so far, including calls still in flight
    pub fn used(&self) -> u64 {
        self.state.lock().used
    }

    /// Whether calls are currently paused
    pub fn is_paused(&self) -> bool {
        self.state
            .lock()
            .paused_until
            .is_some_and(|(until, _)| Instant::now() < until)
    }
}

/// Wraps a backend with usage metering
#[derive(Debug)]
pub struct QuotaBackend {
    inner: Arc<dyn TranslationBackend>,
    meter: Arc<UsageMeter>,
}

impl QuotaBackend {
    /// Wrap `inner`, reporting to `meter`
    pub fn new(inner: Arc<dyn TranslationBackend>, meter: Arc<UsageMeter>) -> Self {
        Self { inner, meter }
    }

    fn observe<T>(&self, result: Result<T, ProviderError>, characters: u64) -> Result<T, ProviderError> {
        if result.is_err() {
            self.meter.refund(characters);
        }
        match result {
            Ok(value) => Ok(value),
            Err(ProviderError::ApiError { status_code: 402, message }) => {
                self.meter.pause_for_payment();
                Err(ProviderError::PaymentRequired(message))
            }
            Err(e @ ProviderError::PaymentRequired(_)) => {
                self.meter.pause_for_payment();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

fn char_count(text: &str) -> u64 {
    text.chars().count() as u64
}

#[async_trait]
impl TranslationBackend for QuotaBackend {
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
        let characters = char_count(text);
        self.meter.reserve(characters)?;

        let result = self
            .inner
            .translate(text, source_language, target_language, context_before, context_after)
            .await;
        self.observe(result, characters)
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
        let characters: u64 = items.iter().map(|item| char_count(&item.text)).sum();
        self.meter.reserve(characters)?;

        let result = self
            .inner
            .translate_batch(items, source_language, target_language, pre_context, post_context)
            .await;
        self.observe(result, characters)
    }
}
