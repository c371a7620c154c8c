//! # Audio Processing Module
//!
//! Prepares request audio for the Whisper backend.
//!
//! ## Key Components:
//! - **Decode**: WAV / raw PCM parsing, downmix and resampling to 16 kHz mono
//! - **VAD**: Energy-based voice activity filtering into model-sized chunks
//! - **Mel**: Filterbank for the log-mel spectrogram
//!
//! ## Model Input Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Samples**: 32-bit float in [-1.0, 1.0]

pub mod decode;      // File/buffer decoding and resampling
pub mod mel;         // Mel filterbank
pub mod vad;         // Voice activity filtering

pub use decode::{load_source, TARGET_SAMPLE_RATE};
