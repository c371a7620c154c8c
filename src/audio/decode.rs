//! # Audio Decoding
//!
//! Turns request audio (a path or an uploaded buffer) into the format the
//! model consumes: 16 kHz, mono, 32-bit float samples in [-1.0, 1.0].
//!
//! ## Accepted Inputs:
//! - **WAV** (RIFF) with 8/16/24-bit PCM or 32-bit float samples, any sample
//!   rate, any channel count (downmixed, then resampled)
//! - **Raw PCM**: anything without a RIFF header is read as 16-bit
//!   little-endian mono at 16 kHz

use crate::transcription::model::AudioSource;
use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Sample rate expected by Whisper models.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Read and decode the audio behind a request.
pub fn load_source(source: &AudioSource) -> Result<Vec<f32>> {
    match source {
        AudioSource::Path(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read audio file {}", path.display()))?;
            decode_bytes(&bytes)
        }
        AudioSource::Bytes(bytes) => decode_bytes(bytes),
    }
}

/// Decode an in-memory audio file.
pub fn decode_bytes(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.is_empty() {
        return Err(anyhow!("Audio data is empty"));
    }
    if is_wav(bytes) {
        decode_wav(bytes)
    } else {
        decode_raw_pcm(bytes)
    }
}

fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

fn decode_wav(bytes: &[u8]) -> Result<Vec<f32>> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor).context("Failed to parse WAV audio")?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .iter()
            .map(|&s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => pcm_to_float(&samples),
        wav::BitDepth::TwentyFour(samples) => samples
            .iter()
            .map(|&s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => return Err(anyhow!("WAV file contains no samples")),
    };

    let mono = downmix(&interleaved, header.channel_count.max(1) as usize);
    tracing::debug!(
        "Decoded WAV: {} Hz, {} channel(s), {} frames",
        header.sampling_rate,
        header.channel_count,
        mono.len()
    );
    Ok(sanitize(resample_linear(
        &mono,
        header.sampling_rate,
        TARGET_SAMPLE_RATE,
    )))
}

fn decode_raw_pcm(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(anyhow!(
            "Unsupported audio format: expected WAV or 16-bit PCM (got {} bytes)",
            bytes.len()
        ));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(pcm_to_float(&samples))
}

/// Scale 16-bit PCM into [-1.0, 1.0].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Average interleaved frames into a single channel.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler; adequate for speech at these rates.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from as f64 / to as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

fn sanitize(mut samples: Vec<f32>) -> Vec<f32> {
    for sample in &mut samples {
        *sample = if sample.is_finite() {
            sample.clamp(-1.0, 1.0)
        } else {
            0.0
        };
    }
    samples
}

/// Minimal PCM16 WAV encoder for fixtures.
#[cfg(test)]
pub fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    use byteorder::WriteBytesExt;

    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>(36 + data_len).unwrap();
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.write_u32::<LittleEndian>(16).unwrap();
    out.write_u16::<LittleEndian>(1).unwrap();
    out.write_u16::<LittleEndian>(channels).unwrap();
    out.write_u32::<LittleEndian>(sample_rate).unwrap();
    out.write_u32::<LittleEndian>(sample_rate * channels as u32 * 2).unwrap();
    out.write_u16::<LittleEndian>(channels * 2).unwrap();
    out.write_u16::<LittleEndian>(16).unwrap();
    out.extend_from_slice(b"data");
    out.write_u32::<LittleEndian>(data_len).unwrap();
    for &sample in samples {
        out.write_i16::<LittleEndian>(sample).unwrap();
    }
    out
}
