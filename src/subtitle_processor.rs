use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use walkdir::WalkDir;

use crate::errors::SubtitleError;
use crate::language_utils;

// @module: Subtitle file I/O, validation gate and output path selection

// @const: SRT timestamp regex
static TIMESTAMP_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{2}):(\d{2}):(\d{2})[,.](\d{3}) --> (\d{2}):(\d{2}):(\d{2})[,.](\d{3})")
        .expect("timestamp regex is valid")
});

/// Directory name used for fallback output locations
const FALLBACK_DIRNAME: &str = "yastq";

// @struct: Single subtitle entry
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleEntry {
    // @field: Sequence number, also the entry's position in translation batches
    pub seq_num: usize,

    // @field: Start time in ms
    pub start_time_ms: u64,

    // @field: End time in ms
    pub end_time_ms: u64,

    // @field: Subtitle text
    pub text: String,
}

impl SubtitleEntry {
    /// Creates a new subtitle entry
    pub fn new(seq_num: usize, start_time_ms: u64, end_time_ms: u64, text: impl Into<String>) -> Self {
        SubtitleEntry {
            seq_num,
            start_time_ms,
            end_time_ms,
            text: text.into(),
        }
    }

    // @creates: Validated subtitle entry
    // @validates: Time range and non-empty text
    pub fn new_validated(seq_num: usize, start_time_ms: u64, end_time_ms: u64, text: String) -> Result<Self> {
        if end_time_ms <= start_time_ms {
            return Err(anyhow!(
                "Invalid time range: end time {} <= start time {}",
                end_time_ms, start_time_ms
            ));
        }

        let trimmed_text = text.trim();
        if trimmed_text.is_empty() {
            return Err(anyhow!("Empty subtitle text for entry {}", seq_num));
        }

        Ok(SubtitleEntry::new(seq_num, start_time_ms, end_time_ms, trimmed_text))
    }

    /// Display duration of the entry
    pub fn duration_ms(&self) -> u64 {
        self.end_time_ms.saturating_sub(self.start_time_ms)
    }

    /// Format a timestamp in milliseconds to SRT format (HH:MM:SS,mmm)
    pub fn format_timestamp(ms: u64) -> String {
        let hours = ms / 3_600_000;
        let minutes = (ms % 3_600_000) / 60_000;
        let seconds = (ms % 60_000) / 1_000;
        let millis = ms % 1_000;

        format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, millis)
    }
}

impl fmt::Display for SubtitleEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.seq_num)?;
        writeln!(
            f,
            "{} --> {}",
            Self::format_timestamp(self.start_time_ms),
            Self::format_timestamp(self.end_time_ms)
        )?;
        writeln!(f, "{}", self.text)?;
        writeln!(f)
    }
}

/// Parse SRT content into entries, renumbered from 1 in start-time order
///
/// Malformed blocks are skipped with a warning. Content without a single
/// usable block yields an empty list rather than an error so the caller can
/// decide whether to fall back to embedded extraction.
pub fn parse_srt_string(content: &str) -> Vec<SubtitleEntry> {
    let mut entries = Vec::new();

    let mut current_seq_num: Option<usize> = None;
    let mut current_times: Option<(u64, u64)> = None;
    let mut current_text = String::new();

    let mut flush = |seq_num: Option<usize>, times: Option<(u64, u64)>, text: &mut String| {
        if let (Some(seq_num), Some((start_ms, end_ms))) = (seq_num, times) {
            match SubtitleEntry::new_validated(seq_num, start_ms, end_ms, text.clone()) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping invalid subtitle entry {}: {}", seq_num, e),
            }
        }
        text.clear();
    };

    // Strip a UTF-8 BOM, common in files produced on Windows
    let content = content.trim_start_matches('\u{feff}');

    for (line_number, line) in content.lines().enumerate() {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            if current_times.is_some() && !current_text.is_empty() {
                flush(current_seq_num.take(), current_times.take(), &mut current_text);
            }
            continue;
        }

        if current_seq_num.is_none() && current_text.is_empty() {
            if let Ok(num) = trimmed.parse::<usize>() {
                current_seq_num = Some(num);
                continue;
            }
        }

        if current_seq_num.is_some() && current_times.is_none() {
            if let Some(caps) = TIMESTAMP_REGEX.captures(trimmed) {
                current_times = Some((parse_timestamp_to_ms(&caps, 1), parse_timestamp_to_ms(&caps, 5)));
                continue;
            }
        }

        if current_times.is_some() {
            if !current_text.is_empty() {
                current_text.push('\n');
            }
            current_text.push_str(trimmed);
        } else {
            debug!("Unexpected text at line {} before sequence number or timestamp: {}", line_number + 1, trimmed);
        }
    }

    if current_times.is_some() && !current_text.is_empty() {
        flush(current_seq_num.take(), current_times.take(), &mut current_text);
    }

    entries.sort_by_key(|entry| entry.start_time_ms);
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.seq_num = i + 1;
    }

    entries
}

/// Parse timestamp captures starting at `start_idx` to milliseconds
fn parse_timestamp_to_ms(caps: &regex::Captures, start_idx: usize) -> u64 {
    let part = |offset: usize| -> u64 {
        caps.get(start_idx + offset)
            .map_or(0, |m| m.as_str().parse().unwrap_or(0))
    };

    (part(0) * 3600 + part(1) * 60 + part(2)) * 1000 + part(3)
}

/// Render entries as SRT text
pub fn render_srt(entries: &[SubtitleEntry]) -> String {
    entries.iter().map(|entry| entry.to_string()).collect()
}

/// Shift end times so no entry runs into the next one
///
/// Entries are sorted by start time first. Returns how many entries changed.
pub fn fix_overlaps(entries: &mut [SubtitleEntry]) -> usize {
    entries.sort_by_key(|entry| entry.start_time_ms);

    let mut fixed = 0;
    for i in 0..entries.len().saturating_sub(1) {
        let next_start = entries[i + 1].start_time_ms;
        if entries[i].end_time_ms > next_start {
            let new_end = next_start.saturating_sub(1).max(entries[i].start_time_ms);
            entries[i].end_time_ms = new_end;
            fixed += 1;
        }
    }

    if fixed > 0 {
        debug!("Fixed {} overlapping subtitle entries", fixed);
    }
    fixed
}

/// Limits for the subtitle quality gate
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOptions {
    /// Largest accepted file
    pub max_file_size_bytes: u64,
    /// Longest accepted text line
    pub max_line_length: usize,
    /// Shortest accepted display duration
    pub min_duration_ms: u64,
    /// Longest accepted display duration
    pub max_duration_ms: u64,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 2 * 1024 * 1024,
            max_line_length: 500,
            min_duration_ms: 500,
            max_duration_ms: 10_000,
        }
    }
}

/// Check a subtitle file against the quality gate
///
/// Returns `SubtitleError::Invalid` with the first violated rule.
pub async fn validate_subtitle(path: &Path, options: &ValidationOptions) -> Result<(), SubtitleError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| SubtitleError::NotFound(path.display().to_string()))?;

    if metadata.len() > options.max_file_size_bytes {
        return Err(SubtitleError::Invalid(format!(
            "file is {} bytes, limit is {}",
            metadata.len(),
            options.max_file_size_bytes
        )));
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| SubtitleError::Invalid(format!("unreadable: {}", e)))?;
    let content = String::from_utf8(bytes)
        .map_err(|_| SubtitleError::Invalid("content is not valid UTF-8".to_string()))?;

    let entries = parse_srt_string(&content);
    if entries.is_empty() {
        return Err(SubtitleError::Invalid("no subtitle entries".to_string()));
    }

    for entry in &entries {
        let duration = entry.duration_ms();
        if duration < options.min_duration_ms || duration > options.max_duration_ms {
            return Err(SubtitleError::Invalid(format!(
                "entry {} lasts {} ms, allowed range is {}..={} ms",
                entry.seq_num, duration, options.min_duration_ms, options.max_duration_ms
            )));
        }
        if let Some(line) = entry.text.lines().find(|l| l.chars().count() > options.max_line_length) {
            return Err(SubtitleError::Invalid(format!(
                "entry {} has a {} character line, limit is {}",
                entry.seq_num,
                line.chars().count(),
                options.max_line_length
            )));
        }
    }

    Ok(())
}

/// File name stem with a trailing language tag removed
///
/// "Movie.2020.en.srt" and "Movie.2020.mkv" both give "Movie.2020".
fn base_stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "subtitle".to_string());

    match stem.rsplit_once('.') {
        Some((head, tag)) if !head.is_empty() && is_language_tag(tag) => head.to_string(),
        _ => stem,
    }
}

fn is_language_tag(tag: &str) -> bool {
    (2..=3).contains(&tag.len()) && language_utils::validate_language_code(tag).is_ok()
}

/// Where a translated subtitle may be written, in order of preference
///
/// The first candidate sits beside the source; the others live in the
/// user data directory and the temp directory for read-only media folders.
pub fn output_path_candidates(source_path: &Path, target_language: &str) -> Vec<PathBuf> {
    let file_name = format!("{}.{}.srt", base_stem(source_path), target_language.to_lowercase());

    let mut candidates = Vec::with_capacity(3);
    if let Some(parent) = source_path.parent() {
        candidates.push(parent.join(&file_name));
    }
    if let Some(data_dir) = dirs::data_local_dir() {
        candidates.push(data_dir.join(FALLBACK_DIRNAME).join("subtitles").join(&file_name));
    }
    candidates.push(std::env::temp_dir().join(FALLBACK_DIRNAME).join(&file_name));
    candidates
}

/// An external subtitle file found next to a media file
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredSubtitle {
    /// File path
    pub path: PathBuf,
    /// Language tag from the file name, if any
    pub language: Option<String>,
}

/// Find external SRT files belonging to a media file
pub fn discover_subtitles(media_path: &Path) -> Vec<DiscoveredSubtitle> {
    let Some(dir) = media_path.parent() else {
        return Vec::new();
    };
    let stem = base_stem(media_path);

    let mut found: Vec<DiscoveredSubtitle> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("srt"))
                && p.file_name().is_some_and(|n| n.to_string_lossy().starts_with(&stem))
        })
        .map(|path| {
            let language = path
                .file_stem()
                .and_then(|s| s.to_string_lossy().rsplit_once('.').map(|(_, tag)| tag.to_string()))
                .filter(|tag| is_language_tag(tag))
                .map(|tag| tag.to_lowercase());
            DiscoveredSubtitle { path, language }
        })
        .collect();

    found.sort_by(|a, b| a.path.cmp(&b.path));
    found
}

/// Subtitle storage used by translation jobs
#[async_trait]
pub trait SubtitleIo: Send + Sync {
    /// Read and parse a subtitle file; a missing file is `SubtitleError::NotFound`
    async fn read_subtitles(&self, path: &Path) -> Result<Vec<SubtitleEntry>>;

    /// Write entries, creating parent directories
    async fn write_subtitles(&self, path: &Path, entries: &[SubtitleEntry]) -> Result<()>;

    /// Run the quality gate
    async fn validate_subtitle(&self, path: &Path, options: &ValidationOptions) -> Result<(), SubtitleError> {
        validate_subtitle(path, options).await
    }

    /// Repair overlapping timings
    fn fix_overlaps(&self, entries: &mut [SubtitleEntry]) -> usize {
        fix_overlaps(entries)
    }

    /// Output locations to try in order
    fn output_paths(&self, source_path: &Path, target_language: &str) -> Vec<PathBuf> {
        output_path_candidates(source_path, target_language)
    }
}

/// SRT files on the local filesystem
#[derive(Debug, Clone, Default)]
pub struct SrtSubtitleIo;

#[async_trait]
impl SubtitleIo for SrtSubtitleIo {
    async fn read_subtitles(&self, path: &Path) -> Result<Vec<SubtitleEntry>> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(SubtitleError::NotFound(path.display().to_string()).into());
        }

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read subtitle file: {}", path.display()))?;
        let content = String::from_utf8_lossy(&bytes);

        Ok(parse_srt_string(&content))
    }

    async fn write_subtitles(&self, path: &Path, entries: &[SubtitleEntry]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        tokio::fs::write(path, render_srt(entries))
            .await
            .with_context(|| format!("Failed to write subtitle file: {}", path.display()))
    }
}
