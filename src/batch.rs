//! # Batch Mode
//!
//! `whisper-stream-server transcribe <AUDIO_PATH>` runs one transcription
//! without starting the HTTP server. It drives the same streamer the
//! endpoints use, so the output is the same `result` document (or the same
//! event sequence with `--progress`).
//!
//! stdout carries only JSON; logs go to stderr.

use crate::config::AppConfig;
use crate::lifecycle::ModelManager;
use crate::transcription::model::{AudioSource, ModelLoader};
use crate::transcription::sink::{EventSink, NdjsonSink, SinkClosed};
use crate::transcription::streamer::{StreamOutcome, TranscriptionRequest, TranscriptionStreamer};
use crate::transcription::types::Event;
use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Args)]
pub struct TranscribeArgs {
    /// Audio file to transcribe (WAV, or raw 16 kHz mono PCM16LE)
    pub audio_path: PathBuf,

    /// Model size, hub repository or local directory
    #[arg(long)]
    pub model: Option<String>,

    /// Language hint (e.g. `en`); detected when omitted
    #[arg(long)]
    pub language: Option<String>,

    /// auto, cpu, cuda or metal
    #[arg(long)]
    pub device: Option<String>,

    #[arg(long)]
    pub compute_type: Option<String>,

    /// Write the result as pretty JSON to this file instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Print every event as one JSON line while transcribing
    #[arg(long)]
    pub progress: bool,
}

impl TranscribeArgs {
    /// Apply the command line model options on top of the loaded config.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(model) = &self.model {
            config.model.name = model.clone();
        }
        if let Some(device) = &self.device {
            config.model.device = device.clone();
        }
        if let Some(compute_type) = &self.compute_type {
            config.model.compute_type = compute_type.clone();
        }
    }

    fn request(&self) -> TranscriptionRequest {
        TranscriptionRequest {
            audio: AudioSource::Path(self.audio_path.clone()),
            language: self
                .language
                .as_ref()
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty()),
            incremental: self.progress,
        }
    }
}

/// Run the transcription described by `args`; returns whether it succeeded.
pub async fn run(args: TranscribeArgs, config: AppConfig, loader: Arc<dyn ModelLoader>) -> Result<bool> {
    info!(
        "Batch transcription of {} with model '{}'",
        args.audio_path.display(),
        config.model.name
    );

    let models = Arc::new(ModelManager::new(config.model_settings(), loader));
    let streamer = TranscriptionStreamer::new(Arc::clone(&models), config.streamer_options());

    let outcome = tokio::task::spawn_blocking(move || -> Result<StreamOutcome> {
        let request = args.request();
        let stdout = std::io::stdout();
        let mut stdout = stdout.lock();

        match &args.output {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("Failed to create output file {}", path.display()))?;
                let mut file = BufWriter::new(file);
                let outcome = if args.progress {
                    let mut progress = NdjsonSink::new(&mut stdout);
                    write_document(
                        &streamer,
                        &request,
                        Some(&mut progress as &mut dyn EventSink),
                        &mut file,
                        true,
                    )?
                } else {
                    write_document(&streamer, &request, None, &mut file, true)?
                };
                file.flush()?;
                info!("Result written to {}", path.display());
                Ok(outcome)
            }
            None if args.progress => {
                let mut sink = NdjsonSink::new(&mut stdout);
                Ok(streamer.run(&request, &mut sink, &CancellationToken::new()))
            }
            None => write_document(&streamer, &request, None, &mut stdout, false),
        }
    })
    .await
    .context("Batch transcription task panicked")??;

    models.unload();
    match outcome {
        StreamOutcome::Completed { segments } => {
            info!("Transcribed {} segment(s)", segments);
            Ok(true)
        }
        StreamOutcome::Failed(err) => {
            tracing::error!("Batch transcription failed: {}", err);
            Ok(false)
        }
        StreamOutcome::Cancelled => Ok(false),
    }
}

/// Run one transcription and write its final document to `out`: the
/// `result` payload, or `{"error": "..."}`. Events are also forwarded to
/// `progress` when given.
pub fn write_document<W: Write>(
    streamer: &TranscriptionStreamer,
    request: &TranscriptionRequest,
    progress: Option<&mut dyn EventSink>,
    out: &mut W,
    pretty: bool,
) -> Result<StreamOutcome> {
    let mut sink = LastEvent {
        forward: progress,
        last: None,
    };
    let outcome = streamer.run(request, &mut sink, &CancellationToken::new());

    let document = match sink.last {
        Some(Event::Result { data }) => serde_json::to_value(data)?,
        Some(Event::Error { message }) => json!({ "error": message }),
        _ => json!({ "error": "Transcription produced no result" }),
    };

    if pretty {
        serde_json::to_writer_pretty(&mut *out, &document)?;
    } else {
        serde_json::to_writer(&mut *out, &document)?;
    }
    writeln!(out)?;
    Ok(outcome)
}

/// Keeps the most recent event, optionally forwarding every event.
struct LastEvent<'a> {
    forward: Option<&'a mut dyn EventSink>,
    last: Option<Event>,
}

impl EventSink for LastEvent<'_> {
    fn emit(&mut self, event: Event) -> Result<(), SinkClosed> {
        if let Some(forward) = self.forward.as_deref_mut() {
            forward.emit(event.clone())?;
        }
        self.last = Some(event);
        Ok(())
    }
}
