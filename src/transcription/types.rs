//! # Transcription Data Types
//!
//! Wire-level types shared by the streamer, the HTTP endpoints and batch mode.
//! Field names follow the verbose Whisper JSON format that existing clients
//! already parse (`word`, `seek`, `avg_logprob`, ...).

use serde::{Deserialize, Serialize};

/// A recognized word with its position in the audio (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// A time-bounded unit of transcribed speech with its quality metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: usize,
    /// Start offset in centiseconds.
    pub seek: u64,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub tokens: Vec<u32>,
    pub temperature: f32,
    pub avg_logprob: f32,
    pub compression_ratio: f32,
    pub no_speech_prob: f32,
    /// Carried separately on the wire (`delta.words`, `result.words`).
    #[serde(skip)]
    pub words: Vec<Word>,
}

impl Segment {
    /// Build a segment with neutral quality metrics.
    pub fn new(id: usize, start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            id,
            seek: (start.max(0.0) * 100.0) as u64,
            start,
            end,
            text: text.into(),
            tokens: Vec::new(),
            temperature: 0.0,
            avg_logprob: -0.5,
            compression_ratio: 2.0,
            no_speech_prob: 0.0,
            words: Vec::new(),
        }
    }

    pub fn with_words(mut self, words: Vec<Word>) -> Self {
        self.words = words;
        self
    }

    /// Words with surrounding whitespace removed, as clients expect them.
    pub fn trimmed_words(&self) -> Vec<Word> {
        self.words
            .iter()
            .map(|w| Word {
                word: w.word.trim().to_string(),
                start: w.start,
                end: w.end,
            })
            .collect()
    }

    /// Copy of the segment as it appears in `result.segments`.
    fn to_record(&self, id: usize) -> Segment {
        Segment {
            id,
            seek: self.seek,
            start: self.start,
            end: self.end,
            text: self.text.trim().to_string(),
            tokens: self.tokens.clone(),
            temperature: self.temperature,
            avg_logprob: self.avg_logprob,
            compression_ratio: self.compression_ratio,
            no_speech_prob: self.no_speech_prob,
            words: Vec::new(),
        }
    }
}

/// Up-front facts the model reports before producing segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionInfo {
    pub language: String,
    pub duration: f64,
}

/// Final verbose transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub task: String,
    pub language: String,
    pub duration: f64,
    pub text: String,
    pub words: Vec<Word>,
    pub segments: Vec<Segment>,
}

impl TranscriptionResult {
    /// Assemble the result from the segments a stream produced.
    ///
    /// Segments are ordered by ascending start time (stable, so ties keep
    /// production order) and renumbered; `text` is the trimmed segment texts
    /// joined by single spaces.
    pub fn assemble(info: &TranscriptionInfo, segments: &[Segment]) -> Self {
        let mut ordered: Vec<&Segment> = segments.iter().collect();
        ordered.sort_by(|a, b| a.start.total_cmp(&b.start));

        let text = ordered
            .iter()
            .map(|s| s.text.trim())
            .collect::<Vec<_>>()
            .join(" ");
        let words = ordered.iter().flat_map(|s| s.trimmed_words()).collect();
        let segments = ordered
            .iter()
            .enumerate()
            .map(|(id, s)| s.to_record(id))
            .collect();

        Self {
            task: "transcribe".to_string(),
            language: info.language.clone(),
            duration: info.duration,
            text,
            words,
            segments,
        }
    }
}

/// Incremental payload sent for each produced segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPayload {
    pub words: Vec<Word>,
    pub segment: Segment,
}

/// One client-visible step of a transcription stream.
///
/// Streams are append-only and end with either `Error` or the completion
/// pair `Status { progress: 100 }` + `Result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Status { message: String, progress: u8 },
    Info { language: String, duration: f64 },
    Progress { progress: f64, processed_duration: f64 },
    Delta { data: DeltaPayload },
    Result { data: TranscriptionResult },
    Error {
        #[serde(rename = "error")]
        message: String,
    },
}

impl Event {
    pub fn status(message: impl Into<String>, progress: u8) -> Self {
        Event::Status {
            message: message.into(),
            progress,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            message: message.into(),
        }
    }

    pub fn delta(segment: &Segment) -> Self {
        Event::Delta {
            data: DeltaPayload {
                words: segment.trimmed_words(),
                segment: segment.to_record(segment.id),
            },
        }
    }

    /// Short name used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Status { .. } => "status",
            Event::Info { .. } => "info",
            Event::Progress { .. } => "progress",
            Event::Delta { .. } => "delta",
            Event::Result { .. } => "result",
            Event::Error { .. } => "error",
        }
    }

    /// Progress carried by the event, if any.
    pub fn progress(&self) -> Option<f64> {
        match self {
            Event::Status { progress, .. } => Some(f64::from(*progress)),
            Event::Progress { progress, .. } => Some(*progress),
            _ => None,
        }
    }

    /// Serialize as a single JSON object.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "type": "error", "error": format!("Failed to encode event: {}", e) })
                .to_string()
        })
    }
}
