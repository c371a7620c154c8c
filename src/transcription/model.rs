//! # Speech Model Capability
//!
//! The narrow interface the streaming core needs from a speech-recognition
//! backend, plus the settings used to construct one.
//!
//! ## Contract:
//! - `transcribe` reports language and duration up front
//! - segments are produced lazily, forward-only and cannot be restarted
//! - a segment already being decoded cannot be interrupted; callers cancel
//!   between segments by simply not pulling the next one

use crate::transcription::types::{Segment, TranscriptionInfo};
use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the audio for one request comes from.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// A file readable by the server process.
    Path(PathBuf),
    /// An uploaded, fully buffered file.
    Bytes(Vec<u8>),
}

impl AudioSource {
    /// Human-readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            AudioSource::Path(path) => path.display().to_string(),
            AudioSource::Bytes(bytes) => format!("<upload: {} bytes>", bytes.len()),
        }
    }
}

/// Voice-activity filtering parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadParameters {
    /// Silences shorter than this do not split speech.
    pub min_silence_duration_ms: u32,
    /// Speech runs shorter than this are dropped.
    pub min_speech_duration_ms: u32,
    /// Padding kept on both sides of each speech run.
    pub speech_pad_ms: u32,
}

impl Default for VadParameters {
    fn default() -> Self {
        Self {
            min_silence_duration_ms: 500,
            min_speech_duration_ms: 250,
            speech_pad_ms: 200,
        }
    }
}

/// Per-call inference options.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeOptions {
    /// Language hint (ISO 639-1). `None` means detect.
    pub language: Option<String>,
    pub word_timestamps: bool,
    /// `None` disables voice-activity filtering.
    pub vad: Option<VadParameters>,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            language: None,
            word_timestamps: true,
            vad: Some(VadParameters::default()),
        }
    }
}

/// Result of starting an inference: facts known up front plus a lazy
/// sequence of segments.
pub struct Transcription<'a> {
    pub info: TranscriptionInfo,
    pub segments: Box<dyn Iterator<Item = Result<Segment>> + 'a>,
}

/// A loaded speech-recognition model.
pub trait SpeechModel: Send + Sync {
    fn transcribe<'a>(
        &'a self,
        audio: &AudioSource,
        options: &TranscribeOptions,
    ) -> Result<Transcription<'a>>;
}

/// Parameters a model is constructed from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSettings {
    pub model_name: String,
    pub compute_type: String,
    pub device: String,
    /// Optional override of the hub cache directory.
    #[serde(skip)]
    pub cache_dir: Option<PathBuf>,
}

/// Constructs model instances. Construction is expensive (downloads,
/// weight loading) and is only ever called by the lifecycle manager.
pub trait ModelLoader: Send + Sync {
    fn load(&self, settings: &ModelSettings) -> Result<Arc<dyn SpeechModel>>;
}
