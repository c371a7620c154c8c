//! # Voice Activity Filtering
//!
//! Energy-based speech detection over 30 ms frames. Produces the sample
//! ranges worth sending to the model, so long silences are skipped and
//! never reach the decoder (where they tend to produce hallucinated text).
//!
//! ## Steps:
//! 1. Classify each frame as speech when its RMS exceeds an adaptive
//!    threshold (a multiple of the quietest frames, with an absolute floor)
//! 2. Join speech runs separated by less than `min_silence_duration_ms`
//! 3. Drop runs shorter than `min_speech_duration_ms`
//! 4. Pad each run by `speech_pad_ms`, merge overlaps
//! 5. Split anything longer than one model window

use crate::audio::decode::TARGET_SAMPLE_RATE;
use crate::transcription::model::VadParameters;
use std::ops::Range;

pub const FRAME_MS: u32 = 30;
const FRAME_SAMPLES: usize = (TARGET_SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;

/// Longest chunk handed to the model in one pass (Whisper's 30 s window).
pub const MAX_CHUNK_SAMPLES: usize = TARGET_SAMPLE_RATE as usize * 30;

/// Absolute RMS floor below which nothing counts as speech.
const MIN_THRESHOLD: f32 = 0.01;
/// Speech must be this many times louder than the noise floor.
const NOISE_MULTIPLIER: f32 = 3.0;

fn ms_to_frames(ms: u32) -> usize {
    (ms as f32 / FRAME_MS as f32).ceil() as usize
}

fn ms_to_samples(ms: u32) -> usize {
    TARGET_SAMPLE_RATE as usize * ms as usize / 1000
}

fn frame_rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
}

/// Estimate the background level from the quietest tenth of the frames.
fn speech_threshold(energies: &[f32]) -> f32 {
    let mut sorted = energies.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = sorted.len() / 10;
    let floor = sorted.get(idx).copied().unwrap_or(0.0);
    (floor * NOISE_MULTIPLIER).max(MIN_THRESHOLD)
}

/// Return the sample ranges that contain speech, in ascending order.
pub fn speech_ranges(samples: &[f32], params: &VadParameters) -> Vec<Range<usize>> {
    if samples.is_empty() {
        return Vec::new();
    }

    let energies: Vec<f32> = samples.chunks(FRAME_SAMPLES).map(frame_rms).collect();
    let threshold = speech_threshold(&energies);

    // Frame-level runs of speech.
    let mut runs: Vec<Range<usize>> = Vec::new();
    let mut current: Option<usize> = None;
    for (i, &energy) in energies.iter().enumerate() {
        match (energy > threshold, current) {
            (true, None) => current = Some(i),
            (false, Some(start)) => {
                runs.push(start..i);
                current = None;
            }
            _ => {}
        }
    }
    if let Some(start) = current {
        runs.push(start..energies.len());
    }

    let min_silence = ms_to_frames(params.min_silence_duration_ms);
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(runs.len());
    for run in runs {
        match merged.last_mut() {
            Some(last) if run.start - last.end < min_silence => last.end = run.end,
            _ => merged.push(run),
        }
    }

    let min_speech = ms_to_frames(params.min_speech_duration_ms);
    let pad = ms_to_samples(params.speech_pad_ms);
    let mut ranges: Vec<Range<usize>> = Vec::new();
    for run in merged.into_iter().filter(|r| r.len() >= min_speech) {
        let start = (run.start * FRAME_SAMPLES).saturating_sub(pad);
        let end = (run.end * FRAME_SAMPLES + pad).min(samples.len());
        match ranges.last_mut() {
            Some(last) if start <= last.end => last.end = last.end.max(end),
            _ => ranges.push(start..end),
        }
    }

    ranges.into_iter().flat_map(split_window).collect()
}

/// Cut a range into consecutive pieces of at most one model window.
pub fn split_window(range: Range<usize>) -> Vec<Range<usize>> {
    let mut pieces = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let end = (start + MAX_CHUNK_SAMPLES).min(range.end);
        pieces.push(start..end);
        start = end;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: usize = TARGET_SAMPLE_RATE as usize;

    fn tone(seconds: f32) -> Vec<f32> {
        let n = (seconds * SR as f32) as usize;
        (0..n)
            .map(|i| 0.5 * (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / SR as f32).sin())
            .collect()
    }

    fn silence(seconds: f32) -> Vec<f32> {
        vec![0.0; (seconds * SR as f32) as usize]
    }

    #[test]
    fn test_silence_has_no_speech() {
        assert!(speech_ranges(&silence(3.0), &VadParameters::default()).is_empty());
        assert!(speech_ranges(&[], &VadParameters::default()).is_empty());
    }

    #[test]
    fn test_short_gap_is_bridged() {
        let mut audio = silence(1.0);
        audio.extend(tone(1.0));
        audio.extend(silence(0.2));
        audio.extend(tone(1.0));
        audio.extend(silence(1.0));

        let ranges = speech_ranges(&audio, &VadParameters::default());
        assert_eq!(ranges.len(), 1);
        // Roughly 1.0 s .. 3.2 s, plus padding.
        assert!(ranges[0].start <= SR);
        assert!(ranges[0].end >= 3 * SR);
    }

    #[test]
    fn test_long_gap_splits_speech() {
        let mut audio = tone(1.0);
        audio.extend(silence(2.0));
        audio.extend(tone(1.0));

        let ranges = speech_ranges(&audio, &VadParameters::default());
        assert_eq!(ranges.len(), 2);
        assert!(ranges[1].start > 2 * SR);
    }

    #[test]
    fn test_blips_shorter_than_min_speech_are_dropped() {
        let mut audio = silence(1.0);
        audio.extend(tone(0.06));
        audio.extend(silence(1.0));
        assert!(speech_ranges(&audio, &VadParameters::default()).is_empty());
    }

    #[test]
    fn test_long_speech_is_split_into_windows() {
        let pieces = split_window(0..MAX_CHUNK_SAMPLES * 2 + 10);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[2], MAX_CHUNK_SAMPLES * 2..MAX_CHUNK_SAMPLES * 2 + 10);
    }
}
