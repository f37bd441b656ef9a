/*!
 * Translation backends.
 *
 * Backends implement [`TranslationBackend`]; cross-cutting behavior is
 * layered on by wrapping:
 * - `RetryingBackend`: exponential backoff for transient failures
 * - `QuotaBackend`: character metering and payment-required pauses
 *
 * Concrete backends:
 * - `OllamaBackend`: local Ollama server
 * - `MockBackend`: scripted behavior for tests and dry runs
 */

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::app_config::{BackendKind, ProviderConfig};
use crate::errors::ProviderError;

pub mod mock;
pub mod ollama;
pub mod quota;
pub mod retry;

pub use mock::{MockBackend, MockBehavior};
pub use ollama::OllamaBackend;
pub use quota::{QuotaBackend, UsageMeter};
pub use retry::RetryingBackend;

/// One subtitle line in a batch call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    /// Position of the line in the subtitle file
    pub position: usize,
    /// Text to translate
    pub text: String,
}

impl BatchItem {
    /// Create an item
    pub fn new(position: usize, text: impl Into<String>) -> Self {
        Self { position, text: text.into() }
    }
}

/// A service able to translate subtitle text
///
/// Failures are always reported as `ProviderError`, never as an empty
/// string, so retry and splitting logic can react to them.
#[async_trait]
pub trait TranslationBackend: Send + Sync + Debug {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Translate one line, with optional surrounding lines as context
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
        context_before: &[String],
        context_after: &[String],
    ) -> Result<String, ProviderError>;

    /// Whether `translate_batch` is implemented
    fn supports_batch(&self) -> bool {
        false
    }

    /// Translate several lines at once
    ///
    /// The result maps positions to translations. Positions missing from
    /// the map were not translated.
    async fn translate_batch(
        &self,
        _items: &[BatchItem],
        _source_language: &str,
        _target_language: &str,
        _pre_context: &[String],
        _post_context: &[String],
    ) -> Result<HashMap<usize, String>, ProviderError> {
        Err(ProviderError::BatchUnsupported)
    }
}

static ENTRY_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<<ENTRY_(\d+)>>").expect("entry marker regex is valid"));

const END_MARKER: &str = "<<END>>";

/// Encode a batch for text-completion backends
///
/// Each item is preceded by `<<ENTRY_n>>` (n being its position) and the
/// whole batch ends with `<<END>>`. Context lines are sent as plain text
/// outside the markers.
pub fn encode_batch(items: &[BatchItem], pre_context: &[String], post_context: &[String]) -> String {
    let mut text = String::new();

    if !pre_context.is_empty() {
        text.push_str("[Context before, do not translate]\n");
        for line in pre_context {
            text.push_str(line);
            text.push('\n');
        }
        text.push('\n');
    }

    for item in items {
        text.push_str(&format!("<<ENTRY_{}>>\n", item.position));
        text.push_str(&item.text);
        text.push('\n');
    }
    text.push_str(END_MARKER);

    if !post_context.is_empty() {
        text.push_str("\n\n[Context after, do not translate]\n");
        text.push_str(&post_context.join("\n"));
    }

    text
}

/// Decode a marker-delimited response
///
/// Only positions that were requested are kept; blank segments and
/// unknown markers are dropped, which the caller sees as missing items.
pub fn decode_batch(response: &str, requested: &[BatchItem]) -> HashMap<usize, String> {
    let body = match response.find(END_MARKER) {
        Some(end) => &response[..end],
        None => response,
    };

    let markers: Vec<(usize, usize, usize)> = ENTRY_MARKER
        .captures_iter(body)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let position = caps.get(1)?.as_str().parse().ok()?;
            Some((position, whole.start(), whole.end()))
        })
        .collect();

    let mut translated = HashMap::new();
    for (i, (position, _, content_start)) in markers.iter().enumerate() {
        if !requested.iter().any(|item| item.position == *position) {
            continue;
        }
        let content_end = markers.get(i + 1).map(|(_, start, _)| *start).unwrap_or(body.len());
        let text = body[*content_start..content_end].trim();
        if !text.is_empty() {
            translated.insert(*position, text.to_string());
        }
    }

    translated
}

/// Build the configured backend with its decorators
///
/// Returns the backend and the usage meter it reports to.
pub fn build_backend(config: &ProviderConfig) -> (Arc<dyn TranslationBackend>, Arc<UsageMeter>) {
    let base: Arc<dyn TranslationBackend> = match config.kind {
        BackendKind::Ollama => Arc::new(OllamaBackend::new(config)),
        BackendKind::Mock => Arc::new(MockBackend::working()),
    };

    let retrying: Arc<dyn TranslationBackend> = Arc::new(RetryingBackend::new(
        base,
        config.retry_count,
        Duration::from_millis(config.retry_backoff_ms),
    ));

    let meter = Arc::new(UsageMeter::new(
        config.character_quota,
        Duration::from_secs(config.payment_pause_secs),
    ));
    let backend = Arc::new(QuotaBackend::new(retrying, meter.clone()));

    (backend, meter)
}
