//! # Event Sinks
//!
//! Destinations for the events a transcription stream produces. The streamer
//! pushes into a sink and blocks there when the consumer is slow, which is
//! how back-pressure reaches the inference loop.

use crate::transcription::types::Event;
use std::fmt;
use std::io::Write;
use tokio::sync::mpsc;

/// The consumer is gone; no further events can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

impl fmt::Display for SinkClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event sink closed")
    }
}

impl std::error::Error for SinkClosed {}

pub trait EventSink {
    fn emit(&mut self, event: Event) -> Result<(), SinkClosed>;
}

/// Collects every event; used by batch mode and tests.
impl EventSink for Vec<Event> {
    fn emit(&mut self, event: Event) -> Result<(), SinkClosed> {
        self.push(event);
        Ok(())
    }
}

/// Forwards events to the async side over a bounded channel.
///
/// Must be used from a blocking context (`spawn_blocking`), since a full
/// channel parks the calling thread until the transport drains it.
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&mut self, event: Event) -> Result<(), SinkClosed> {
        self.tx.blocking_send(event).map_err(|_| SinkClosed)
    }
}

/// Writes one JSON object per line and flushes after each event.
pub struct NdjsonSink<W: Write> {
    out: W,
}

impl<W: Write> NdjsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EventSink for NdjsonSink<W> {
    fn emit(&mut self, event: Event) -> Result<(), SinkClosed> {
        writeln!(self.out, "{}", event.to_json()).map_err(|_| SinkClosed)?;
        self.out.flush().map_err(|_| SinkClosed)
    }
}
