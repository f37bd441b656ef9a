//! Application configuration module
//!
//! This module handles the application configuration including loading,
//! validating and saving configuration settings, plus the runtime
//! settings provider consulted by the scheduler and translation jobs.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::database::Repository;
use crate::subtitle_processor::ValidationOptions;

/// Represents the application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// SQLite database path; the user data directory when absent
    #[serde(default)]
    pub database_path: Option<String>,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Scheduler tuning
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Translation backend
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Runtime settings seeded into the database on startup
    #[serde(default = "default_settings")]
    pub settings: HashMap<String, String>,
}

/// Translation backend type
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    // @provider: Ollama
    #[default]
    Ollama,
    // @provider: Offline echo backend for dry runs
    Mock,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "mock" => Ok(Self::Mock),
            _ => Err(anyhow!("Invalid provider type: {}", s)),
        }
    }
}

/// Backend configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    // @field: Backend type identifier
    #[serde(rename = "type", default)]
    pub kind: BackendKind,

    // @field: Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,

    // @field: Service URL
    #[serde(default = "default_ollama_endpoint")]
    pub endpoint: String,

    // @field: Timeout seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry count for transient failures
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Base backoff in milliseconds, doubled on each retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Optional character budget; calls fail once it is spent
    #[serde(default)]
    pub character_quota: Option<u64>,

    /// How long to stop calling the backend after a payment-required answer
    #[serde(default = "default_payment_pause_secs")]
    pub payment_pause_secs: u64,

    /// System prompt template for translation
    /// Placeholders: {source_language}, {target_language}
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Temperature parameter for text generation (0.0 to 1.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            model: default_ollama_model(),
            endpoint: default_ollama_endpoint(),
            timeout_secs: default_timeout_secs(),
            retry_count: default_retry_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            character_quota: None,
            payment_pause_secs: default_payment_pause_secs(),
            system_prompt: default_system_prompt(),
            temperature: default_temperature(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Poll interval while workers are busy
    #[serde(default = "default_active_poll_interval_ms")]
    pub active_poll_interval_ms: u64,

    /// Poll interval while fully idle
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,

    /// How long shutdown waits for running jobs
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Interval of the failed-request retry sweep; 0 disables it
    #[serde(default)]
    pub retry_sweep_interval_secs: u64,

    /// Selection retries when a claim loses a race
    #[serde(default = "default_max_claim_attempts")]
    pub max_claim_attempts: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            active_poll_interval_ms: default_active_poll_interval_ms(),
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            retry_sweep_interval_secs: 0,
            max_claim_attempts: default_max_claim_attempts(),
        }
    }
}

/// Log verbosity level
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000 // 1 second base backoff time, doubled on each retry
}

fn default_payment_pause_secs() -> u64 {
    900
}

fn default_temperature() -> f32 {
    0.3
}

fn default_ollama_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.2:3b".to_string()
}

fn default_system_prompt() -> String {
    "You are a professional subtitle translator. Translate the following text from {source_language} to {target_language}. Preserve formatting and line breaks, and answer with the translation only.".to_string()
}

fn default_active_poll_interval_ms() -> u64 {
    500
}

fn default_idle_poll_interval_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_max_claim_attempts() -> usize {
    5
}

fn default_settings() -> HashMap<String, String> {
    [
        (keys::MAX_CONCURRENT_JOBS, "1"),
        (keys::MAX_WORKERS, "4"),
        (keys::USE_BATCH_TRANSLATION, "true"),
        (keys::MAX_BATCH_SIZE, "50"),
        (keys::USE_DEFERRED_REPAIR, "true"),
        (keys::MAX_SPLIT_ATTEMPTS, "3"),
        (keys::REPAIR_CONTEXT_RADIUS, "3"),
        (keys::REPAIR_MAX_RETRIES, "1"),
        (keys::FIX_OVERLAPPING_SUBTITLES, "true"),
        (keys::TARGET_LANGUAGES, "[]"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Config {
    /// Load the configuration file, creating it with defaults when missing
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let file = File::open(path)
                .with_context(|| format!("Failed to open config file: {}", path.display()))?;
            let config: Config = serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            return Ok(config);
        }

        warn!("Config file not found at '{}', creating default config.", path.display());
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config)
            .context("Failed to serialize default config to JSON")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write default config to file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate the configuration for consistency and required values
    pub fn validate(&self) -> Result<()> {
        if self.provider.kind == BackendKind::Ollama {
            if self.provider.endpoint.trim().is_empty() {
                return Err(anyhow!("An endpoint is required for the Ollama provider"));
            }
            url::Url::parse(&self.provider.endpoint)
                .with_context(|| format!("Invalid provider endpoint: {}", self.provider.endpoint))?;
        }
        if self.scheduler.idle_poll_interval_ms < self.scheduler.active_poll_interval_ms {
            return Err(anyhow!(
                "idle_poll_interval_ms ({}) must not be shorter than active_poll_interval_ms ({})",
                self.scheduler.idle_poll_interval_ms,
                self.scheduler.active_poll_interval_ms
            ));
        }
        if let Some(value) = self.settings.get(keys::MAX_CONCURRENT_JOBS) {
            match value.parse::<usize>() {
                Ok(n) if n >= 1 => {}
                _ => return Err(anyhow!("{} must be a positive integer, got '{}'", keys::MAX_CONCURRENT_JOBS, value)),
            }
        }
        Ok(())
    }
}

/// Default implementation for Config
impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: None,
            log_level: LogLevel::default(),
            scheduler: SchedulerConfig::default(),
            provider: ProviderConfig::default(),
            settings: default_settings(),
        }
    }
}

/// Names of runtime settings
pub mod keys {
    /// Concurrent translation slots (limiter capacity)
    pub const MAX_CONCURRENT_JOBS: &str = "max_concurrent_jobs";
    /// Concurrent executions the worker pool runs
    pub const MAX_WORKERS: &str = "max_workers";
    pub const USE_BATCH_TRANSLATION: &str = "use_batch_translation";
    pub const MAX_BATCH_SIZE: &str = "max_batch_size";
    pub const CONTEXT_LINES_BEFORE: &str = "context_lines_before";
    pub const CONTEXT_LINES_AFTER: &str = "context_lines_after";
    pub const BATCH_CONTEXT_ENABLED: &str = "batch_context_enabled";
    pub const BATCH_CONTEXT_BEFORE: &str = "batch_context_before";
    pub const BATCH_CONTEXT_AFTER: &str = "batch_context_after";
    pub const STRIP_SUBTITLE_FORMATTING: &str = "strip_subtitle_formatting";
    pub const REMOVE_MARKUP: &str = "remove_markup";
    pub const MAX_LINE_LENGTH: &str = "max_line_length";
    pub const FIX_OVERLAPPING_SUBTITLES: &str = "fix_overlapping_subtitles";
    pub const USE_DEFERRED_REPAIR: &str = "use_deferred_repair";
    pub const MAX_SPLIT_ATTEMPTS: &str = "max_split_attempts";
    pub const REPAIR_CONTEXT_RADIUS: &str = "repair_context_radius";
    pub const REPAIR_MAX_RETRIES: &str = "repair_max_retries";
    pub const MAX_EXTRACTION_RETRIES: &str = "max_extraction_retries";
    pub const SUBTITLE_VALIDATION_ENABLED: &str = "subtitle_validation_enabled";
    pub const VALIDATION_MAX_FILE_SIZE_BYTES: &str = "validation_max_file_size_bytes";
    pub const VALIDATION_MAX_LINE_LENGTH: &str = "validation_max_line_length";
    pub const VALIDATION_MIN_DURATION_MS: &str = "validation_min_duration_ms";
    pub const VALIDATION_MAX_DURATION_MS: &str = "validation_max_duration_ms";
    /// JSON list of `{ "name": .., "code": .. }`
    pub const TARGET_LANGUAGES: &str = "target_languages";
    /// JSON list of `{ "name": .., "code": .. }`
    pub const SOURCE_LANGUAGES: &str = "source_languages";

    /// Every known key, in display order
    pub const ALL: &[&str] = &[
        MAX_CONCURRENT_JOBS,
        MAX_WORKERS,
        USE_BATCH_TRANSLATION,
        MAX_BATCH_SIZE,
        CONTEXT_LINES_BEFORE,
        CONTEXT_LINES_AFTER,
        BATCH_CONTEXT_ENABLED,
        BATCH_CONTEXT_BEFORE,
        BATCH_CONTEXT_AFTER,
        STRIP_SUBTITLE_FORMATTING,
        REMOVE_MARKUP,
        MAX_LINE_LENGTH,
        FIX_OVERLAPPING_SUBTITLES,
        USE_DEFERRED_REPAIR,
        MAX_SPLIT_ATTEMPTS,
        REPAIR_CONTEXT_RADIUS,
        REPAIR_MAX_RETRIES,
        MAX_EXTRACTION_RETRIES,
        SUBTITLE_VALIDATION_ENABLED,
        VALIDATION_MAX_FILE_SIZE_BYTES,
        VALIDATION_MAX_LINE_LENGTH,
        VALIDATION_MIN_DURATION_MS,
        VALIDATION_MAX_DURATION_MS,
        TARGET_LANGUAGES,
        SOURCE_LANGUAGES,
    ];
}

/// A language entry as stored in the language list settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSetting {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// ISO code
    pub code: String,
}

/// Source of runtime settings
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Read one setting
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    /// Read several settings; missing keys are absent from the map
    async fn get_settings(&self, keys: &[&str]) -> Result<HashMap<String, String>>;
}

impl dyn SettingsProvider {
    /// Read a setting holding a JSON list; missing or blank yields an empty list
    pub async fn get_setting_as_json<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        match self.get_setting(key).await? {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .with_context(|| format!("Setting '{}' is not a valid JSON list", key)),
            _ => Ok(Vec::new()),
        }
    }
}

/// Settings stored in the database `settings` table
#[derive(Clone)]
pub struct DatabaseSettings {
    repo: Repository,
}

impl DatabaseSettings {
    /// Wrap a repository
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl SettingsProvider for DatabaseSettings {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.repo.get_setting(key).await
    }

    async fn get_settings(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        self.repo.get_settings(keys).await
    }
}

/// In-memory settings, mutable at runtime
#[derive(Default)]
pub struct StaticSettings {
    values: parking_lot::RwLock<HashMap<String, String>>,
}

impl StaticSettings {
    /// Create from key/value pairs
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: parking_lot::RwLock::new(
                values.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            ),
        }
    }

    /// Replace one value
    pub fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }

    /// Share as a trait object
    pub fn shared(self) -> Arc<dyn SettingsProvider> {
        Arc::new(self)
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn get_settings(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        let values = self.values.read();
        Ok(keys
            .iter()
            .filter_map(|k| values.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }
}

/// Settings that drive one translation job, resolved once per execution
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationSettings {
    pub use_batch_translation: bool,
    pub max_batch_size: usize,
    pub context_lines_before: usize,
    pub context_lines_after: usize,
    pub batch_context_enabled: bool,
    pub batch_context_before: usize,
    pub batch_context_after: usize,
    pub strip_formatting: bool,
    pub remove_markup: bool,
    /// 0 disables rewrapping
    pub max_line_length: usize,
    pub fix_overlaps: bool,
    pub use_deferred_repair: bool,
    pub max_split_attempts: usize,
    pub repair_context_radius: usize,
    pub repair_max_retries: usize,
    pub max_extraction_retries: usize,
    /// Quality gate; None when validation is disabled
    pub validation: Option<ValidationOptions>,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self::from_map(&HashMap::new())
    }
}

impl TranslationSettings {
    /// Every key this struct reads
    pub const KEYS: [&'static str; 21] = [
        keys::USE_BATCH_TRANSLATION,
        keys::MAX_BATCH_SIZE,
        keys::CONTEXT_LINES_BEFORE,
        keys::CONTEXT_LINES_AFTER,
        keys::BATCH_CONTEXT_ENABLED,
        keys::BATCH_CONTEXT_BEFORE,
        keys::BATCH_CONTEXT_AFTER,
        keys::STRIP_SUBTITLE_FORMATTING,
        keys::REMOVE_MARKUP,
        keys::MAX_LINE_LENGTH,
        keys::FIX_OVERLAPPING_SUBTITLES,
        keys::USE_DEFERRED_REPAIR,
        keys::MAX_SPLIT_ATTEMPTS,
        keys::REPAIR_CONTEXT_RADIUS,
        keys::REPAIR_MAX_RETRIES,
        keys::MAX_EXTRACTION_RETRIES,
        keys::SUBTITLE_VALIDATION_ENABLED,
        keys::VALIDATION_MAX_FILE_SIZE_BYTES,
        keys::VALIDATION_MAX_LINE_LENGTH,
        keys::VALIDATION_MIN_DURATION_MS,
        keys::VALIDATION_MAX_DURATION_MS,
    ];

    /// Resolve from a settings provider
    pub async fn resolve(settings: &dyn SettingsProvider) -> Result<Self> {
        let values = settings.get_settings(&Self::KEYS).await?;
        Ok(Self::from_map(&values))
    }

    /// Build from raw values, falling back to defaults for missing or malformed ones
    pub fn from_map(values: &HashMap<String, String>) -> Self {
        let flag = |key: &str, default: bool| parse_bool(values.get(key), default);
        let number = |key: &str, default: usize| parse_usize(values.get(key), default);

        let validation = flag(keys::SUBTITLE_VALIDATION_ENABLED, false).then(|| {
            let defaults = ValidationOptions::default();
            ValidationOptions {
                max_file_size_bytes: number(keys::VALIDATION_MAX_FILE_SIZE_BYTES, defaults.max_file_size_bytes as usize) as u64,
                max_line_length: number(keys::VALIDATION_MAX_LINE_LENGTH, defaults.max_line_length),
                min_duration_ms: number(keys::VALIDATION_MIN_DURATION_MS, defaults.min_duration_ms as usize) as u64,
                max_duration_ms: number(keys::VALIDATION_MAX_DURATION_MS, defaults.max_duration_ms as usize) as u64,
            }
        });

        Self {
            use_batch_translation: flag(keys::USE_BATCH_TRANSLATION, false),
            max_batch_size: number(keys::MAX_BATCH_SIZE, 50).max(1),
            context_lines_before: number(keys::CONTEXT_LINES_BEFORE, 0),
            context_lines_after: number(keys::CONTEXT_LINES_AFTER, 0),
            batch_context_enabled: flag(keys::BATCH_CONTEXT_ENABLED, false),
            batch_context_before: number(keys::BATCH_CONTEXT_BEFORE, 3),
            batch_context_after: number(keys::BATCH_CONTEXT_AFTER, 3),
            strip_formatting: flag(keys::STRIP_SUBTITLE_FORMATTING, false),
            remove_markup: flag(keys::REMOVE_MARKUP, false),
            max_line_length: number(keys::MAX_LINE_LENGTH, 0),
            fix_overlaps: flag(keys::FIX_OVERLAPPING_SUBTITLES, false),
            use_deferred_repair: flag(keys::USE_DEFERRED_REPAIR, false),
            max_split_attempts: number(keys::MAX_SPLIT_ATTEMPTS, 3).max(1),
            repair_context_radius: number(keys::REPAIR_CONTEXT_RADIUS, 3),
            repair_max_retries: number(keys::REPAIR_MAX_RETRIES, 1),
            max_extraction_retries: number(keys::MAX_EXTRACTION_RETRIES, 2),
            validation,
        }
    }
}

/// Parse a boolean setting
pub fn parse_bool(value: Option<&String>, default: bool) -> bool {
    match value.map(|v| v.trim().to_lowercase()) {
        Some(v) if v == "true" || v == "1" || v == "yes" => true,
        Some(v) if v == "false" || v == "0" || v == "no" => false,
        _ => default,
    }
}

/// Parse an unsigned numeric setting
pub fn parse_usize(value: Option<&String>, default: usize) -> usize {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
