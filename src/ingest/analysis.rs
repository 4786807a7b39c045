//! Recording analysis: duration, transcript, and silence intervals.
//!
//! The three functions are pure over the file bytes, so a redelivered job
//! produces the same result. Audio is probed with symphonia; only packet
//! durations are read, nothing is decoded to PCM.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{AnalysisResult, SilenceInterval};

/// Errors that can occur while analysing a recording
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read audio in {path}: {source}")]
    Decode {
        path: PathBuf,
        source: SymphoniaError,
    },

    #[error("No audio track in {0}")]
    NoAudioTrack(PathBuf),

    #[error("Unknown sample rate in {0}")]
    UnknownSampleRate(PathBuf),

    #[error("Transcriber failed: {0}")]
    Transcriber(String),

    #[error("Analysis task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Which transcript function to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriberKind {
    /// Placeholder transcript describing the sampled span
    #[default]
    Sample,
    /// Local whisper binary
    Whisper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub transcriber: TranscriberKind,
    pub whisper_path: String,
    pub whisper_model: String,
    pub whisper_language: Option<String>,
    /// Leading span the transcript covers
    pub transcript_sample_seconds: u32,
    pub silence_window_seconds: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            transcriber: TranscriberKind::Sample,
            whisper_path: "whisper".to_string(),
            whisper_model: "base".to_string(),
            whisper_language: None,
            transcript_sample_seconds: 20,
            silence_window_seconds: 5,
        }
    }
}

/// Analysis over one stored file
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, path: &Path) -> Result<AnalysisResult, AnalysisError>;
}

/// Build the analyzer selected by configuration
pub fn build_analyzer(config: &AnalysisConfig) -> Arc<dyn Analyzer> {
    match config.transcriber {
        TranscriberKind::Sample => Arc::new(AudioAnalyzer::new(config)),
        TranscriberKind::Whisper => Arc::new(WhisperAnalyzer::new(config)),
    }
}

/// Default analyzer: probed duration, sampled-span transcript, windowed silence
#[derive(Debug, Clone)]
pub struct AudioAnalyzer {
    transcript_sample_seconds: u32,
    silence_window_seconds: u32,
}

impl AudioAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            transcript_sample_seconds: config.transcript_sample_seconds,
            silence_window_seconds: config.silence_window_seconds,
        }
    }
}

#[async_trait]
impl Analyzer for AudioAnalyzer {
    fn name(&self) -> &str {
        "sample"
    }

    async fn analyze(&self, path: &Path) -> Result<AnalysisResult, AnalysisError> {
        let total_ms = probe_duration(path).await?;
        let duration_sec = whole_seconds(total_ms);

        Ok(AnalysisResult {
            duration_sec,
            transcript: sample_transcript(total_ms, self.transcript_sample_seconds),
            silence: silence_marks(duration_sec, self.silence_window_seconds),
        })
    }
}

/// Same duration and silence as [`AudioAnalyzer`], transcript from whisper
#[derive(Debug, Clone)]
pub struct WhisperAnalyzer {
    binary: String,
    model: String,
    language: Option<String>,
    silence_window_seconds: u32,
}

impl WhisperAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            binary: config.whisper_path.clone(),
            model: config.whisper_model.clone(),
            language: config.whisper_language.clone(),
            silence_window_seconds: config.silence_window_seconds,
        }
    }

    async fn transcribe(&self, audio_path: &Path) -> Result<String, AnalysisError> {
        let temp_dir = tempfile::tempdir().map_err(|source| AnalysisError::Io {
            path: std::env::temp_dir(),
            source,
        })?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg(audio_path)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json");
        if let Some(language) = &self.language {
            cmd.arg("--language").arg(language);
        }

        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                AnalysisError::Transcriber(format!("failed to run {}: {e}", self.binary))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AnalysisError::Transcriber(stderr.trim().to_string()));
        }

        let stem = audio_path.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{stem}.json"));
        let json = tokio::fs::read_to_string(&json_path)
            .await
            .map_err(|source| AnalysisError::Io {
                path: json_path.clone(),
                source,
            })?;

        let parsed: WhisperOutput = serde_json::from_str(&json)
            .map_err(|e| AnalysisError::Transcriber(format!("bad whisper output: {e}")))?;
        Ok(parsed.text.trim().to_string())
    }
}

/// Whisper JSON output (only the text is used)
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
}

#[async_trait]
impl Analyzer for WhisperAnalyzer {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn analyze(&self, path: &Path) -> Result<AnalysisResult, AnalysisError> {
        let total_ms = probe_duration(path).await?;
        let duration_sec = whole_seconds(total_ms);
        let transcript = self.transcribe(path).await?;

        Ok(AnalysisResult {
            duration_sec,
            transcript,
            silence: silence_marks(duration_sec, self.silence_window_seconds),
        })
    }
}

/// Total duration in milliseconds, probed off the async runtime
pub async fn probe_duration(path: &Path) -> Result<u64, AnalysisError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || probe_duration_blocking(&path)).await?
}

fn probe_duration_blocking(path: &Path) -> Result<u64, AnalysisError> {
    let file = std::fs::File::open(path).map_err(|source| AnalysisError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let decode_err = |source| AnalysisError::Decode {
        path: path.to_path_buf(),
        source,
    };

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let stream = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(decode_err)?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| AnalysisError::NoAudioTrack(path.to_path_buf()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .filter(|rate| *rate > 0)
        .ok_or_else(|| AnalysisError::UnknownSampleRate(path.to_path_buf()))?;
    let n_frames = track.codec_params.n_frames;

    let frames = match n_frames {
        Some(n) => n,
        None => {
            // No frame count in the header: sum packet durations
            let mut frames = 0u64;
            loop {
                match format.next_packet() {
                    Ok(packet) if packet.track_id() == track_id => frames += packet.dur,
                    Ok(_) => {}
                    Err(SymphoniaError::IoError(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break
                    }
                    Err(e) => return Err(decode_err(e)),
                }
            }
            frames
        }
    };

    let total_ms = frames.saturating_mul(1000) / u64::from(sample_rate);
    debug!(path = %path.display(), frames, sample_rate, total_ms, "Probed audio");
    Ok(total_ms)
}

/// Whole seconds, truncated
pub fn whole_seconds(total_ms: u64) -> u32 {
    u32::try_from(total_ms / 1000).unwrap_or(u32::MAX)
}

/// Transcript naming the leading span that was sampled
pub fn sample_transcript(total_ms: u64, sample_seconds: u32) -> String {
    let sample_ms = total_ms.min(u64::from(sample_seconds) * 1000);
    format!("Detected speech fragment: {sample_ms}ms sample")
}

/// One-second marks starting at `window`, every `2 * window` seconds
pub fn silence_marks(total_sec: u32, window: u32) -> Vec<SilenceInterval> {
    let mut marks = Vec::new();
    if window == 0 {
        return marks;
    }

    let mut t = window;
    while t < total_sec {
        marks.push(SilenceInterval {
            start: t,
            end: (t + 1).min(total_sec),
        });
        t = t.saturating_add(window.saturating_mul(2));
    }
    marks
}
