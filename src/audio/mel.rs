//! Slaney-style mel filterbank used to turn 16 kHz audio into Whisper's
//! log-mel input. The layout is row-major `[n_mels][N_FFT / 2 + 1]`, which
//! is what `candle_transformers::models::whisper::audio::pcm_to_mel` expects.

use crate::audio::decode::TARGET_SAMPLE_RATE;

/// FFT size used by every Whisper checkpoint.
pub const N_FFT: usize = 400;

fn hz_to_mel(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4_f32).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4_f32).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}

/// Build a flattened, area-normalized triangular filterbank spanning
/// 0 Hz to Nyquist.
pub fn mel_filters(n_mels: usize) -> Vec<f32> {
    let n_freqs = N_FFT / 2 + 1;
    let sr = TARGET_SAMPLE_RATE as f32;
    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(sr / 2.0);

    let hz_pts: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (lower, center, upper) = (hz_pts[m], hz_pts[m + 1], hz_pts[m + 2]);
        let enorm = 2.0 / (upper - lower).max(1e-10);
        for k in 0..n_freqs {
            let freq = k as f32 * sr / N_FFT as f32;
            let weight = if freq >= lower && freq <= center {
                (freq - lower) / (center - lower).max(1e-10)
            } else if freq > center && freq <= upper {
                (upper - freq) / (upper - center).max(1e-10)
            } else {
                0.0
            };
            filters[m * n_freqs + k] = (weight * enorm).max(0.0);
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_scale_round_trips_at_knee() {
        assert!((mel_to_hz(hz_to_mel(1_000.0)) - 1_000.0).abs() < 1e-2);
        assert!((hz_to_mel(1_000.0) - 15.0).abs() < 1e-4);
    }

    #[test]
    fn test_filterbank_shape_and_coverage() {
        let filters = mel_filters(80);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| *w >= 0.0));
        // Every filter has some support.
        for row in filters.chunks(201) {
            assert!(row.iter().any(|w| *w > 0.0));
        }
    }
}
