//! # Transcription Streamer
//!
//! Drives one transcription from request to terminal event and turns every
//! step into an [`Event`] pushed into an [`EventSink`].
//!
//! ## Event Order (success):
//! ```text
//! status(5) → info → (progress [→ delta])* → status(99) → status(100) → result
//! ```
//! Any failure replaces the remainder of the stream with a single `error`
//! event. Progress never decreases.
//!
//! The caller is expected to hold the activity lock for the whole call;
//! `run` is synchronous and may block for a long time, so the HTTP layer
//! runs it on the blocking pool.

use crate::error::StreamError;
use crate::lifecycle::manager::ModelManager;
use crate::transcription::model::{AudioSource, TranscribeOptions, VadParameters};
use crate::transcription::sink::EventSink;
use crate::transcription::types::{Event, TranscriptionResult};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const PROGRESS_STARTED: u8 = 5;
const PROGRESS_FORMATTING: u8 = 99;
const PROGRESS_DONE: u8 = 100;
/// Share of the progress bar covered by segment production.
const PROGRESS_SPAN: f64 = 94.0;

/// One transcription job.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub audio: AudioSource,
    pub language: Option<String>,
    /// Emit a `delta` event per segment.
    pub incremental: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamerOptions {
    /// Server-wide switch; `false` suppresses deltas even when requested.
    pub emit_deltas: bool,
    pub vad_min_silence_ms: u32,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            emit_deltas: true,
            vad_min_silence_ms: 500,
        }
    }
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed { segments: usize },
    Failed(StreamError),
    Cancelled,
}

pub struct TranscriptionStreamer {
    models: Arc<ModelManager>,
    options: StreamerOptions,
}

impl TranscriptionStreamer {
    pub fn new(models: Arc<ModelManager>, options: StreamerOptions) -> Self {
        Self { models, options }
    }

    /// Run the transcription to completion, failure or cancellation.
    ///
    /// Never returns an error and never unwinds: model errors and model
    /// panics alike are reported both to the sink (as one `error` event) and
    /// to the caller.
    pub fn run(
        &self,
        request: &TranscriptionRequest,
        sink: &mut dyn EventSink,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let driven = panic::catch_unwind(AssertUnwindSafe(|| self.drive(request, &mut *sink, cancel)))
            .unwrap_or_else(|payload| {
                tracing::error!("Model panicked: {}", panic_message(payload.as_ref()));
                Err(StreamError::Inference(format!(
                    "model panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        match driven {
            Ok(segments) => {
                tracing::info!(segments, "Transcription completed");
                StreamOutcome::Completed { segments }
            }
            Err(StreamError::ClientDisconnected) => {
                tracing::info!("Client disconnected, transcription stopped");
                // Best effort: the consumer is most likely gone already.
                let _ = sink.emit(Event::error(StreamError::ClientDisconnected.to_string()));
                StreamOutcome::Cancelled
            }
            Err(err) => {
                tracing::warn!("Transcription failed: {}", err);
                let _ = sink.emit(Event::error(err.to_string()));
                StreamOutcome::Failed(err)
            }
        }
    }

    fn drive(
        &self,
        request: &TranscriptionRequest,
        sink: &mut dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<usize, StreamError> {
        if let AudioSource::Path(path) = &request.audio {
            if !path.exists() {
                return Err(StreamError::InputNotFound(path.clone()));
            }
        }

        let model = self.models.load().map_err(StreamError::model_load)?;

        send(sink, Event::status("Starting transcription", PROGRESS_STARTED))?;

        let options = TranscribeOptions {
            language: request.language.clone(),
            word_timestamps: true,
            vad: Some(VadParameters {
                min_silence_duration_ms: self.options.vad_min_silence_ms,
                ..VadParameters::default()
            }),
        };
        tracing::debug!(audio = %request.audio.describe(), language = ?options.language, "Starting inference");
        let transcription = model
            .transcribe(&request.audio, &options)
            .map_err(StreamError::inference)?;

        let info = transcription.info;
        send(
            sink,
            Event::Info {
                language: info.language.clone(),
                duration: info.duration,
            },
        )?;

        let emit_deltas = request.incremental && self.options.emit_deltas;
        let mut progress = f64::from(PROGRESS_STARTED);
        let mut collected = Vec::new();

        for segment in transcription.segments {
            let segment = segment.map_err(StreamError::inference)?;

            progress = progress.max(segment_progress(segment.end, info.duration));
            send(
                sink,
                Event::Progress {
                    progress,
                    processed_duration: segment.end,
                },
            )?;
            if emit_deltas {
                send(sink, Event::delta(&segment))?;
            }
            collected.push(segment);

            if cancel.is_cancelled() {
                return Err(StreamError::ClientDisconnected);
            }
        }

        send(sink, Event::status("Formatting results", PROGRESS_FORMATTING))?;
        let result = TranscriptionResult::assemble(&info, &collected);
        send(sink, Event::status("Done", PROGRESS_DONE))?;
        send(sink, Event::Result { data: result })?;

        Ok(collected.len())
    }
}

fn send(sink: &mut dyn EventSink, event: Event) -> Result<(), StreamError> {
    tracing::trace!(kind = event.kind(), progress = ?event.progress(), "Emitting event");
    sink.emit(event).map_err(|_| StreamError::ClientDisconnected)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Map a segment end time onto the 5..=99 band of the progress bar.
fn segment_progress(end: f64, duration: f64) -> f64 {
    if duration <= 0.0 || !duration.is_finite() {
        return f64::from(PROGRESS_FORMATTING);
    }
    let value = f64::from(PROGRESS_STARTED) + (end / duration) * PROGRESS_SPAN;
    value.clamp(f64::from(PROGRESS_STARTED), f64::from(PROGRESS_FORMATTING))
}
