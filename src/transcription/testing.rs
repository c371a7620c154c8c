//! Scripted model and loader used by unit tests across the crate.

use crate::transcription::model::{
    AudioSource, ModelLoader, ModelSettings, SpeechModel, TranscribeOptions, Transcription,
};
use crate::transcription::types::{Segment, TranscriptionInfo, Word};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn settings() -> ModelSettings {
    ModelSettings {
        model_name: "base".to_string(),
        compute_type: "int8".to_string(),
        device: "cpu".to_string(),
        cache_dir: None,
    }
}

/// `count` back-to-back segments of `length` seconds each, one word apiece.
pub fn speech_segments(count: usize, length: f64) -> Vec<Segment> {
    (0..count)
        .map(|i| {
            let start = i as f64 * length;
            let end = start + length;
            let text = format!(" word{}", i);
            Segment::new(i, start, end, text.clone()).with_words(vec![Word {
                word: text,
                start,
                end,
            }])
        })
        .collect()
}

/// What a scripted model produces for every call.
#[derive(Debug, Clone)]
pub struct Script {
    pub info: TranscriptionInfo,
    pub segments: Vec<Segment>,
    /// Yield an error instead of the segment at this index.
    pub fail_at: Option<usize>,
    /// Panic instead of producing the segment at this index.
    pub panic_at: Option<usize>,
    /// Fail before producing anything.
    pub fail_start: Option<String>,
    /// Simulated decode time per segment.
    pub segment_delay: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            info: TranscriptionInfo {
                language: "en".to_string(),
                duration: 9.0,
            },
            segments: speech_segments(3, 3.0),
            fail_at: None,
            panic_at: None,
            fail_start: None,
            segment_delay: Duration::ZERO,
        }
    }
}

/// Records how many inferences run at the same time.
#[derive(Debug, Default)]
pub struct ConcurrencyTracker {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

impl ConcurrencyTracker {
    fn enter(self: &Arc<Self>) -> TrackerGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        TrackerGuard(Arc::clone(self))
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct TrackerGuard(Arc<ConcurrencyTracker>);

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ScriptedModel {
    script: Script,
    tracker: Arc<ConcurrencyTracker>,
}

struct ScriptedSegments {
    segments: std::vec::IntoIter<Segment>,
    index: usize,
    fail_at: Option<usize>,
    panic_at: Option<usize>,
    delay: Duration,
    _active: TrackerGuard,
}

impl Iterator for ScriptedSegments {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        let segment = self.segments.next()?;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let index = self.index;
        self.index += 1;
        if self.panic_at == Some(index) {
            panic!("tensor shape mismatch at segment {}", index);
        }
        if self.fail_at == Some(index) {
            return Some(Err(anyhow!("decoder exploded at segment {}", index)));
        }
        Some(Ok(segment))
    }
}

impl SpeechModel for ScriptedModel {
    fn transcribe<'a>(
        &'a self,
        _audio: &AudioSource,
        _options: &TranscribeOptions,
    ) -> Result<Transcription<'a>> {
        if let Some(message) = &self.script.fail_start {
            return Err(anyhow!("{}", message));
        }
        let active = self.tracker.enter();
        Ok(Transcription {
            info: self.script.info.clone(),
            segments: Box::new(ScriptedSegments {
                segments: self.script.segments.clone().into_iter(),
                index: 0,
                fail_at: self.script.fail_at,
                panic_at: self.script.panic_at,
                delay: self.script.segment_delay,
                _active: active,
            }),
        })
    }
}

pub struct ScriptedLoader {
    script: Mutex<Script>,
    tracker: Arc<ConcurrencyTracker>,
    constructions: AtomicUsize,
    fail_next: Mutex<Option<String>>,
    last_options: Arc<Mutex<Option<TranscribeOptions>>>,
}

impl ScriptedLoader {
    pub fn new() -> Arc<Self> {
        Self::with_script(Script::default())
    }

    pub fn with_script(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            tracker: Arc::new(ConcurrencyTracker::default()),
            constructions: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
            last_options: Arc::new(Mutex::new(None)),
        })
    }

    pub fn fail_next_load(&self, message: &str) {
        *self.fail_next.lock() = Some(message.to_string());
    }

    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn tracker(&self) -> Arc<ConcurrencyTracker> {
        Arc::clone(&self.tracker)
    }

    /// Options seen by the most recent `transcribe` call.
    pub fn last_options(&self) -> Option<TranscribeOptions> {
        self.last_options.lock().clone()
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self, _settings: &ModelSettings) -> Result<Arc<dyn SpeechModel>> {
        if let Some(message) = self.fail_next.lock().take() {
            return Err(anyhow!("{}", message));
        }
        self.constructions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingModel {
            inner: ScriptedModel {
                script: self.script.lock().clone(),
                tracker: Arc::clone(&self.tracker),
            },
            last_options: Arc::clone(&self.last_options),
        }))
    }
}

/// Wraps a scripted model and remembers the options it was called with.
struct RecordingModel {
    inner: ScriptedModel,
    last_options: Arc<Mutex<Option<TranscribeOptions>>>,
}

impl SpeechModel for RecordingModel {
    fn transcribe<'a>(
        &'a self,
        audio: &AudioSource,
        options: &TranscribeOptions,
    ) -> Result<Transcription<'a>> {
        *self.last_options.lock() = Some(options.clone());
        self.inner.transcribe(audio, options)
    }
}
