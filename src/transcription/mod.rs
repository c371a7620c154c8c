//! # Transcription Module
//!
//! Speech-to-text streaming on top of Whisper models running on Candle-rs.
//!
//! ## Key Components:
//! - **Types**: Events, segments and the final verbose result
//! - **Model**: The capability trait the streamer drives, plus its settings
//! - **Streamer**: Turns one inference into an ordered event stream
//! - **Sinks**: Where events go (SSE channel, NDJSON stdout, in-memory)
//! - **Whisper**: The Candle-backed model implementation
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, good technical vocabulary
//! - **large-v3**: ~1550MB, best accuracy but slowest

pub mod model;       // Speech model capability and settings
pub mod sink;        // Event destinations
pub mod streamer;    // Transcription state machine
pub mod types;       // Wire-level data types
pub mod whisper;     // Candle Whisper backend

#[cfg(test)]
pub mod testing;     // Scripted models for unit tests

