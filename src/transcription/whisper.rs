//! # Whisper Backend
//!
//! Candle-rs implementation of [`SpeechModel`]. Loads OpenAI Whisper
//! checkpoints from the HuggingFace hub (or a local directory) and decodes
//! audio window by window, so segments are produced lazily as the streamer
//! pulls them.
//!
//! ## Decoding Pipeline (per window):
//! 1. Decode the audio to 16 kHz mono and split it into speech windows
//!    (VAD) of at most 30 s
//! 2. Log-mel spectrogram → encoder
//! 3. Greedy decoding, retried at higher temperatures when the output looks
//!    degenerate (high compression ratio or low average log-probability)
//! 4. Windows the model considers silent are skipped
//!
//! Segment boundaries are the speech windows; word times are spread over
//! the window proportionally to their length.

use crate::audio::{self, mel, vad};
use crate::device::{self, DevicePreference};
use crate::transcription::model::{
    AudioSource, ModelLoader, ModelSettings, SpeechModel, TranscribeOptions, Transcription,
};
use crate::transcription::types::{Segment, TranscriptionInfo, Word};
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{ops::softmax, VarBuilder};
use candle_transformers::models::whisper::{self as m, audio as whisper_audio, Config};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Language codes with a `<|xx|>` token in multilingual checkpoints.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

/// Vocabulary size from which a checkpoint carries language tokens.
const MULTILINGUAL_VOCAB: usize = 51865;

/// Seed for temperature sampling, so reruns give identical transcripts.
const SAMPLING_SEED: u64 = 299_792_458;

/// Map a configured model name to a hub repository id.
pub fn repo_for(model_name: &str) -> String {
    if model_name.contains('/') {
        return model_name.to_string();
    }
    match model_name {
        "large" => "openai/whisper-large-v3".to_string(),
        "turbo" | "large-v3-turbo" => "openai/whisper-large-v3-turbo".to_string(),
        name if name.starts_with("distil-") => format!("distil-whisper/{}", name),
        name => format!("openai/whisper-{}", name),
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Tokenizer has no token {}", token))
}

/// Run an async hub download from blocking code.
fn block_on<F: Future>(future: F) -> Result<F::Output> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => Ok(tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(future)),
    }
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

impl ModelFiles {
    fn in_dir(dir: &Path) -> Self {
        Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights: dir.join("model.safetensors"),
        }
    }
}

async fn fetch_from_hub(repo_id: &str, cache_dir: Option<&Path>) -> Result<ModelFiles> {
    use hf_hub::api::tokio::ApiBuilder;

    let mut builder = ApiBuilder::new()
        .with_token(std::env::var("HF_TOKEN").ok())
        .with_progress(false);
    if let Some(dir) = cache_dir {
        tracing::debug!("Using hub cache dir {}", dir.display());
        builder = builder.with_cache_dir(dir.to_path_buf());
    }
    let api = builder
        .build()
        .context("Failed to initialize HuggingFace API client")?;

    tracing::info!("Fetching model files from {}", repo_id);
    let repo = api.model(repo_id.to_string());
    let config = repo
        .get("config.json")
        .await
        .with_context(|| format!("Failed to download config.json from {}", repo_id))?;
    let tokenizer = repo
        .get("tokenizer.json")
        .await
        .with_context(|| format!("Failed to download tokenizer.json from {}", repo_id))?;
    let weights = repo
        .get("model.safetensors")
        .await
        .with_context(|| format!("Failed to download model.safetensors from {}", repo_id))?;

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

/// Builds [`WhisperModel`] instances from [`ModelSettings`].
#[derive(Debug, Default)]
pub struct WhisperLoader;

impl ModelLoader for WhisperLoader {
    fn load(&self, settings: &ModelSettings) -> Result<Arc<dyn SpeechModel>> {
        let local = Path::new(&settings.model_name);
        let files = if local.join("config.json").is_file() {
            tracing::info!("Loading model from local directory {}", local.display());
            ModelFiles::in_dir(local)
        } else {
            let repo_id = repo_for(&settings.model_name);
            block_on(fetch_from_hub(&repo_id, settings.cache_dir.as_deref()))??
        };

        let preference: DevicePreference = settings.device.parse()?;
        let device = device::resolve_device(preference);
        let dtype = device::dtype_for(&settings.compute_type, &device)?;
        tracing::debug!(
            "Using {} with {:?} weights",
            device::describe(&device),
            dtype
        );

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&files.config)
                .with_context(|| format!("Failed to open {}", files.config.display()))?,
        )
        .context("Invalid model config.json")?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        // SAFETY: the weights file is not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], dtype, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        Ok(Arc::new(WhisperModel::new(
            model, config, tokenizer, device, dtype,
        )?))
    }
}

struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    no_speech: Option<u32>,
}

/// A loaded Whisper checkpoint.
pub struct WhisperModel {
    model: Mutex<m::model::Whisper>,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    mel_filters: Vec<f32>,
    suppress: Tensor,
    tokens: SpecialTokens,
}

/// Output of decoding one window.
struct Decoded {
    tokens: Vec<u32>,
    text: String,
    avg_logprob: f64,
    no_speech_prob: f64,
    temperature: f64,
    compression_ratio: f64,
}

impl WhisperModel {
    fn new(
        model: m::model::Whisper,
        config: Config,
        tokenizer: Tokenizer,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        let tokens = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| tokenizer.token_to_id(token)),
        };

        let suppress: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) || i == tokens.no_timestamps {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress = Tensor::new(suppress.as_slice(), &device)?;
        let mel_filters = mel::mel_filters(config.num_mel_bins);

        Ok(Self {
            model: Mutex::new(model),
            config,
            tokenizer,
            device,
            dtype,
            mel_filters,
            suppress,
            tokens,
        })
    }

    fn is_multilingual(&self) -> bool {
        self.config.vocab_size >= MULTILINGUAL_VOCAB
    }

    /// Log-mel spectrogram of one window, padded to the model's 30 s input.
    fn window_mel(&self, samples: &[f32]) -> Result<Tensor> {
        let mut padded = samples.to_vec();
        padded.resize(m::N_SAMPLES.max(samples.len()), 0.0);
        let mel = whisper_audio::pcm_to_mel(&self.config, &padded, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?
            .narrow(2, 0, frames.min(m::N_FRAMES))?;
        Ok(mel.to_dtype(self.dtype)?)
    }

    /// Pick the language token to condition on and its code.
    fn resolve_language(&self, hint: Option<&str>, first_window: &[f32]) -> Result<(Option<u32>, String)> {
        if !self.is_multilingual() {
            return match hint {
                None | Some("en") => Ok((None, "en".to_string())),
                Some(other) => Err(anyhow!(
                    "Language '{}' is not supported by an English-only model",
                    other
                )),
            };
        }

        if let Some(code) = hint {
            let token = self
                .tokenizer
                .token_to_id(&format!("<|{}|>", code))
                .ok_or_else(|| anyhow!("Unsupported language: {}", code))?;
            return Ok((Some(token), code.to_string()));
        }

        let (token, code) = self.detect_language(first_window)?;
        Ok((Some(token), code))
    }

    fn detect_language(&self, samples: &[f32]) -> Result<(u32, String)> {
        let mel = self.window_mel(samples)?;
        let candidates: Vec<(u32, &str)> = LANGUAGES
            .iter()
            .filter_map(|code| {
                self.tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (id, *code))
            })
            .collect();
        let ids: Vec<u32> = candidates.iter().map(|(id, _)| *id).collect();

        let mut model = self.model.lock();
        let features = model.encoder.forward(&mel, true)?;
        let tokens = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = model.decoder.forward(&tokens, &features, true)?;
        let logits = model
            .decoder
            .final_linear(&ys.i(..1)?)?
            .i(0)?
            .i(0)?
            .to_dtype(DType::F32)?;
        let logits = logits.index_select(&Tensor::new(ids.as_slice(), &self.device)?, 0)?;
        let probs = softmax(&logits, D::Minus1)?.to_vec1::<f32>()?;

        let (best, prob) = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .ok_or_else(|| anyhow!("Tokenizer has no language tokens"))?;
        let (id, code) = candidates[best];
        tracing::debug!("Detected language {} (p={:.2})", code, prob);
        Ok((id, code.to_string()))
    }

    fn decode(&self, mel: &Tensor, language: Option<u32>, temperature: f64, rng: &mut StdRng) -> Result<Decoded> {
        let mut model = self.model.lock();
        let features = model.encoder.forward(mel, true)?;
        let sample_len = self.config.max_target_positions / 2;

        let mut tokens = vec![self.tokens.sot];
        tokens.extend(language);
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let prompt_len = tokens.len();

        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &features, i == 0)?;

            if i == 0 {
                if let Some(no_speech) = self.tokens.no_speech {
                    let logits = model
                        .decoder
                        .final_linear(&ys.i(..1)?)?
                        .i(0)?
                        .i(0)?
                        .to_dtype(DType::F32)?;
                    no_speech_prob = softmax(&logits, 0)?
                        .i(no_speech as usize)?
                        .to_scalar::<f32>()? as f64;
                }
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?
                .broadcast_add(&self.suppress)?;

            let next = if temperature > 0.0 {
                let probs: Vec<f32> = softmax(&(&logits / temperature)?, 0)?.to_vec1()?;
                WeightedIndex::new(&probs)?.sample(rng) as u32
            } else {
                let values: Vec<f32> = logits.to_vec1()?;
                values
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i as u32)
                    .unwrap_or(self.tokens.eot)
            };
            tokens.push(next);

            let prob = softmax(&logits, D::Minus1)?
                .i(next as usize)?
                .to_scalar::<f32>()? as f64;
            if next == self.tokens.eot || tokens.len() > self.config.max_target_positions {
                break;
            }
            sum_logprob += prob.ln();
        }

        let generated: Vec<u32> = tokens[prompt_len..]
            .iter()
            .copied()
            .filter(|&t| t < self.tokens.eot)
            .collect();
        let text = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| anyhow!("Failed to decode tokens: {}", e))?;

        Ok(Decoded {
            avg_logprob: sum_logprob / tokens.len() as f64,
            compression_ratio: compression_ratio(&text)?,
            tokens: generated,
            text,
            no_speech_prob,
            temperature,
        })
    }

    fn decode_with_fallback(&self, mel: &Tensor, language: Option<u32>, rng: &mut StdRng) -> Result<Decoded> {
        let last = m::TEMPERATURES.len() - 1;
        for (i, &temperature) in m::TEMPERATURES.iter().enumerate() {
            let decoded = self.decode(mel, language, temperature, rng);
            if i == last {
                return decoded;
            }
            match decoded {
                Ok(d) => {
                    let degenerate = d.compression_ratio > m::COMPRESSION_RATIO_THRESHOLD
                        || d.avg_logprob < m::LOGPROB_THRESHOLD;
                    if !degenerate || d.no_speech_prob > m::NO_SPEECH_THRESHOLD {
                        return Ok(d);
                    }
                    tracing::debug!("Retrying window at temperature {}", m::TEMPERATURES[i + 1]);
                }
                Err(e) => tracing::warn!("Decoding at temperature {} failed: {:#}", temperature, e),
            }
        }
        Err(anyhow!("No decoding temperatures configured"))
    }

    /// Split decoded tokens into words, timed proportionally to their length
    /// within `[start, end]`.
    fn words(&self, tokens: &[u32], start: f64, end: f64) -> Result<Vec<Word>> {
        let mut groups: Vec<Vec<u32>> = Vec::new();
        for &token in tokens {
            let piece = self
                .tokenizer
                .decode(&[token], true)
                .map_err(|e| anyhow!("Failed to decode token: {}", e))?;
            match groups.last_mut() {
                Some(group) if !piece.starts_with(' ') => group.push(token),
                _ => groups.push(vec![token]),
            }
        }

        let mut texts = Vec::with_capacity(groups.len());
        for group in &groups {
            let text = self
                .tokenizer
                .decode(group, true)
                .map_err(|e| anyhow!("Failed to decode word: {}", e))?;
            if !text.trim().is_empty() {
                texts.push(text);
            }
        }
        Ok(spread_words(texts, start, end))
    }
}

/// Assign each word a slice of `[start, end]` proportional to its length.
fn spread_words(texts: Vec<String>, start: f64, end: f64) -> Vec<Word> {
    let total: usize = texts.iter().map(|t| t.trim().chars().count().max(1)).sum();
    let span = (end - start).max(0.0);
    let mut cursor = start;
    texts
        .into_iter()
        .map(|text| {
            let share = text.trim().chars().count().max(1) as f64 / total as f64;
            let word_start = cursor;
            cursor += span * share;
            Word {
                word: text,
                start: round2(word_start),
                end: round2(cursor.min(end)),
            }
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Ratio of raw to zlib-compressed text length; high values mean
/// repetitive output.
fn compression_ratio(text: &str) -> Result<f64> {
    if text.is_empty() {
        return Ok(0.0);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(text.len() as f64 / compressed.len().max(1) as f64)
}

fn seconds(samples: usize) -> f64 {
    samples as f64 / audio::TARGET_SAMPLE_RATE as f64
}

impl SpeechModel for WhisperModel {
    fn transcribe<'a>(
        &'a self,
        source: &AudioSource,
        options: &TranscribeOptions,
    ) -> Result<Transcription<'a>> {
        let samples = audio::load_source(source)?;
        let duration = seconds(samples.len());

        let windows = match &options.vad {
            Some(params) => vad::speech_ranges(&samples, params),
            None => vad::split_window(0..samples.len()),
        };
        tracing::debug!(
            "Audio {:.2}s split into {} window(s)",
            duration,
            windows.len()
        );

        let tracker = windows
            .first()
            .map(|w| &samples[w.start..w.end.min(w.start + vad::MAX_CHUNK_SAMPLES)])
            .unwrap_or(&samples[..]);
        let (language_token, language) = match (&options.language, tracker.is_empty()) {
            (None, true) => (None, "en".to_string()),
            (hint, _) => self.resolve_language(hint.as_deref(), tracker)?,
        };

        Ok(Transcription {
            info: TranscriptionInfo { language, duration },
            segments: Box::new(WhisperSegments {
                model: self,
                samples,
                windows: windows.into_iter(),
                language_token,
                word_timestamps: options.word_timestamps,
                next_id: 0,
                rng: StdRng::seed_from_u64(SAMPLING_SEED),
                failed: false,
            }),
        })
    }
}

/// Lazy, forward-only iterator that decodes one window per `next()`.
struct WhisperSegments<'a> {
    model: &'a WhisperModel,
    samples: Vec<f32>,
    windows: std::vec::IntoIter<Range<usize>>,
    language_token: Option<u32>,
    word_timestamps: bool,
    next_id: usize,
    rng: StdRng,
    failed: bool,
}

impl WhisperSegments<'_> {
    fn decode_window(&mut self, window: Range<usize>) -> Result<Option<Segment>> {
        let start = seconds(window.start);
        let end = seconds(window.end);
        let mel = self.model.window_mel(&self.samples[window])?;
        let decoded = self
            .model
            .decode_with_fallback(&mel, self.language_token, &mut self.rng)?;

        if decoded.no_speech_prob > m::NO_SPEECH_THRESHOLD
            && decoded.avg_logprob < m::LOGPROB_THRESHOLD
        {
            tracing::debug!("Skipping silent window {:.2}s-{:.2}s", start, end);
            return Ok(None);
        }
        if decoded.text.trim().is_empty() {
            return Ok(None);
        }

        let words = if self.word_timestamps {
            self.model.words(&decoded.tokens, start, end)?
        } else {
            Vec::new()
        };

        let mut segment = Segment::new(self.next_id, round2(start), round2(end), decoded.text)
            .with_words(words);
        segment.tokens = decoded.tokens;
        segment.temperature = decoded.temperature as f32;
        segment.avg_logprob = decoded.avg_logprob as f32;
        segment.compression_ratio = decoded.compression_ratio as f32;
        segment.no_speech_prob = if decoded.no_speech_prob.is_nan() {
            0.0
        } else {
            decoded.no_speech_prob as f32
        };
        self.next_id += 1;
        Ok(Some(segment))
    }
}

impl Iterator for WhisperSegments<'_> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while let Some(window) = self.windows.next() {
            match self.decode_window(window) {
                Ok(Some(segment)) => return Some(Ok(segment)),
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_resolution() {
        assert_eq!(repo_for("base"), "openai/whisper-base");
        assert_eq!(repo_for("small.en"), "openai/whisper-small.en");
        assert_eq!(repo_for("large"), "openai/whisper-large-v3");
        assert_eq!(repo_for("turbo"), "openai/whisper-large-v3-turbo");
        assert_eq!(repo_for("distil-large-v3"), "distil-whisper/distil-large-v3");
        assert_eq!(repo_for("Systran/custom"), "Systran/custom");
    }

    #[test]
    fn test_words_are_spread_over_window() {
        let words = spread_words(vec![" hi".into(), " there".into()], 1.0, 2.4);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].start, 1.0);
        assert_eq!(words[0].end, 1.4);
        assert_eq!(words[1].start, 1.4);
        assert_eq!(words[1].end, 2.4);
    }

    #[test]
    fn test_compression_ratio_flags_repetition() {
        let normal = compression_ratio("The quick brown fox jumps over the lazy dog.").unwrap();
        let repeated = compression_ratio(&"thank you ".repeat(40)).unwrap();
        assert!(repeated > m::COMPRESSION_RATIO_THRESHOLD);
        assert!(normal < repeated);
        assert_eq!(compression_ratio("").unwrap(), 0.0);
    }
}
