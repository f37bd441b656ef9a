/*!
 * Embedded subtitle extraction.
 *
 * Lists the subtitle streams of a video with ffprobe and converts a chosen
 * text stream to SRT with ffmpeg. Translation jobs use this when a request
 * has no external subtitle file or the file turned out to be unusable.
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, error, warn};
use serde_json::Value;
use tokio::process::Command;

use crate::language_utils;

/// Subtitle stream inside a media container
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleTrack {
    /// Stream index as reported by ffprobe
    pub index: usize,
    /// Codec name of the stream
    pub codec_name: String,
    /// Language tag (ISO 639-1 or ISO 639-2)
    pub language: Option<String>,
    /// Title tag, if any
    pub title: Option<String>,
}

impl SubtitleTrack {
    /// Image-based codecs cannot be converted to SRT without OCR
    pub fn is_bitmap(&self) -> bool {
        matches!(
            self.codec_name.as_str(),
            "hdmv_pgs_subtitle" | "dvd_subtitle" | "dvb_subtitle" | "xsub"
        )
    }
}

/// Access to subtitles embedded in media files
#[async_trait]
pub trait EmbeddedSubtitleExtractor: Send + Sync {
    /// List the subtitle streams of a media file
    async fn sync_embedded_subtitles(&self, media_path: &Path) -> Result<Vec<SubtitleTrack>>;

    /// Convert one stream to an SRT file inside `out_dir`
    ///
    /// Returns `None` when the stream produced no usable output.
    async fn extract_subtitle(
        &self,
        media_path: &Path,
        stream_index: usize,
        out_dir: &Path,
        codec: &str,
        language: Option<&str>,
    ) -> Result<Option<PathBuf>>;
}

/// Pick the text track that best matches `preferred_language`
///
/// Falls back to an English track, then to the first text track.
pub fn select_track<'a>(tracks: &'a [SubtitleTrack], preferred_language: &str) -> Option<&'a SubtitleTrack> {
    let text_tracks: Vec<&SubtitleTrack> = tracks.iter().filter(|t| !t.is_bitmap()).collect();

    let skipped = tracks.len() - text_tracks.len();
    if skipped > 0 {
        debug!("Ignoring {} bitmap subtitle track(s)", skipped);
    }

    let matches_language = |track: &SubtitleTrack, code: &str| {
        if track
            .language
            .as_deref()
            .is_some_and(|lang| language_utils::language_codes_match(lang, code))
        {
            return true;
        }
        match (&track.title, language_utils::get_language_name(code)) {
            (Some(title), Ok(name)) => title.to_lowercase().contains(&name.to_lowercase()),
            _ => false,
        }
    };

    let find = |code: &str| {
        text_tracks
            .iter()
            .copied()
            .find(|t: &&SubtitleTrack| matches_language(*t, code))
    };

    find(preferred_language)
        .or_else(|| find("en"))
        .or_else(|| text_tracks.first().copied())
}

/// Strip ffmpeg's banner and stream listing, keeping the lines that explain a failure
fn filter_ffmpeg_stderr(stderr: &str) -> String {
    const NOISE_PREFIXES: [&str; 14] = [
        "ffmpeg version",
        "built with",
        "configuration:",
        "lib",
        "Input #",
        "Metadata:",
        "Duration:",
        "Chapter",
        "Stream #",
        "title",
        "DURATION",
        "Output #",
        "Stream mapping:",
        "Press [q]",
    ];

    let meaningful: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !NOISE_PREFIXES.iter().any(|p| line.starts_with(p)))
        .collect();

    if meaningful.is_empty() {
        "unknown ffmpeg error (stderr was empty after filtering)".to_string()
    } else {
        meaningful.join("\n")
    }
}

/// Parse ffprobe's `-show_streams` JSON
fn parse_ffprobe_streams(stdout: &str) -> Result<Vec<SubtitleTrack>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }

    let json: Value = serde_json::from_str(stdout).context("Failed to parse ffprobe JSON output")?;

    let Some(streams) = json.get("streams").and_then(|s| s.as_array()) else {
        return Ok(Vec::new());
    };

    let tag = |stream: &Value, name: &str| {
        stream
            .get("tags")
            .and_then(|t| t.get(name))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    Ok(streams
        .iter()
        .map(|stream| SubtitleTrack {
            index: stream.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
            codec_name: stream
                .get("codec_name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            language: tag(stream, "language"),
            title: tag(stream, "title"),
        })
        .collect())
}

/// Extractor backed by the ffprobe and ffmpeg executables
#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    probe_timeout: Duration,
    extract_timeout: Duration,
}

impl Default for FfmpegExtractor {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(60),
            extract_timeout: Duration::from_secs(120),
        }
    }
}

impl FfmpegExtractor {
    /// Create an extractor with custom timeouts
    pub fn new(probe_timeout: Duration, extract_timeout: Duration) -> Self {
        Self { probe_timeout, extract_timeout }
    }

    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<std::process::Output> {
        let future = Command::new(program).args(args).kill_on_drop(true).output();

        tokio::select! {
            result = future => {
                result.map_err(|e| anyhow!("Failed to execute {}: {}", program, e))
            },
            _ = tokio::time::sleep(timeout) => {
                Err(anyhow!("{} timed out after {} seconds", program, timeout.as_secs()))
            }
        }
    }
}

#[async_trait]
impl EmbeddedSubtitleExtractor for FfmpegExtractor {
    async fn sync_embedded_subtitles(&self, media_path: &Path) -> Result<Vec<SubtitleTrack>> {
        if !media_path.exists() {
            return Err(anyhow!("Video file not found: {:?}", media_path));
        }

        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_streams".to_string(),
            "-select_streams".to_string(),
            "s".to_string(),
            media_path.to_string_lossy().to_string(),
        ];
        let output = self.run("ffprobe", &args, self.probe_timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("ffprobe failed: {}", stderr);
            return Err(anyhow!("ffprobe command failed: {}", stderr));
        }

        let tracks = parse_ffprobe_streams(&String::from_utf8_lossy(&output.stdout))?;
        debug!("Found {} embedded subtitle stream(s) in {:?}", tracks.len(), media_path);
        Ok(tracks)
    }

    async fn extract_subtitle(
        &self,
        media_path: &Path,
        stream_index: usize,
        out_dir: &Path,
        codec: &str,
        language: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        let probe = SubtitleTrack {
            index: stream_index,
            codec_name: codec.to_string(),
            language: None,
            title: None,
        };
        if probe.is_bitmap() {
            warn!("Stream {} uses bitmap codec {}, cannot convert to SRT", stream_index, codec);
            return Ok(None);
        }

        tokio::fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("Failed to create extraction directory: {}", out_dir.display()))?;

        let stem = media_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "embedded".to_string());
        let file_name = match language {
            Some(lang) => format!("{}.{}.{}.srt", stem, stream_index, lang),
            None => format!("{}.{}.srt", stem, stream_index),
        };
        let output_path = out_dir.join(file_name);

        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            media_path.to_string_lossy().to_string(),
            "-map".to_string(),
            format!("0:{}", stream_index),
            "-c:s".to_string(),
            "srt".to_string(),
            output_path.to_string_lossy().to_string(),
        ];
        let output = self.run("ffmpeg", &args, self.extract_timeout).await?;

        if !output.status.success() {
            let filtered = filter_ffmpeg_stderr(&String::from_utf8_lossy(&output.stderr));
            error!("Subtitle extraction failed: {}", filtered);
            return Err(anyhow!("ffmpeg extraction failed: {}", filtered));
        }

        let size = tokio::fs::metadata(&output_path).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            warn!("Extracted stream {} is empty", stream_index);
            return Ok(None);
        }

        Ok(Some(output_path))
    }
}
