//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - Default values (built into the code)
//! - An optional configuration file (`config.toml`, `config.json`, ...)
//! - Environment variables with the `APP__` prefix
//! - The `WHISPER_*` deployment variables used by existing installs
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `WHISPER_*` variables, plus `HOST` / `PORT` (e.g. `WHISPER_MODEL_NAME=small`)
//! 2. `APP__SECTION__KEY` variables (e.g. `APP__LIFECYCLE__UNLOAD_TIMEOUT_SECONDS=120`)
//! 3. Configuration file (`config.*` in the working directory)
//! 4. Default values (defined in the Default impl)
//!
//! Double underscores separate sections because several keys contain
//! single underscores.

use crate::lifecycle::reaper::ReaperSettings;
use crate::transcription::model::ModelSettings;
use crate::transcription::streamer::StreamerOptions;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `shutdown_timeout_seconds` value that disables idle shutdown.
pub const SHUTDOWN_DISABLED: i64 = -1;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub lifecycle: LifecycleConfig,
    pub streaming: StreamingConfig,
    pub auth: AuthConfig,
}

/// Where the HTTP server listens.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (default)
/// - `host = "0.0.0.0"`: Accept connections from any IP address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest body accepted by `/transcribe-upload`.
    pub max_upload_mb: usize,
}

/// Which Whisper checkpoint to run and where.
///
/// ## Fields:
/// - `name`: Size alias (`tiny`, `base`, `small`, `medium`, `large-v3`, `*.en`),
///   a hub repository id (`org/repo`) or a local directory
/// - `compute_type`: `int8`, `float16`, `float32`, ...
/// - `device`: `auto`, `cpu`, `cuda` or `metal`
/// - `cache_dir`: Optional hub cache location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub compute_type: String,
    pub device: String,
    #[serde(default)]
    pub cache_dir: Option<String>,
}

/// Idle handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Unload the model after this many idle seconds.
    pub unload_timeout_seconds: u64,
    /// Exit the process after this many idle seconds; -1 disables.
    pub shutdown_timeout_seconds: i64,
    /// How often the reaper checks (5..=10 seconds).
    pub reaper_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Allow `delta` events when a request asks for them.
    pub emit_deltas: bool,
    /// Events buffered between the decoder and a slow client.
    pub channel_capacity: usize,
    /// Minimum silence that splits speech (VAD).
    pub vad_min_silence_ms: u32,
}

/// Shared-secret authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub password: Option<String>,
    /// Refuse to serve protected routes when no password is configured.
    pub required: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                max_upload_mb: 200,
            },
            model: ModelConfig {
                name: "base".to_string(),
                compute_type: "int8".to_string(),
                device: "auto".to_string(),
                cache_dir: None,
            },
            lifecycle: LifecycleConfig {
                unload_timeout_seconds: 60,
                shutdown_timeout_seconds: SHUTDOWN_DISABLED,
                reaper_interval_seconds: 10,
            },
            streaming: StreamingConfig {
                emit_deltas: true,
                channel_capacity: 1,
                vad_min_silence_ms: 500,
            },
            auth: AuthConfig {
                password: None,
                required: false,
            },
        }
    }
}

/// Deployment variables and the config keys they override.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("WHISPER_HOST", "server.host"),
    ("WHISPER_PORT", "server.port"),
    ("WHISPER_MODEL_NAME", "model.name"),
    ("WHISPER_COMPUTE_TYPE", "model.compute_type"),
    ("WHISPER_DEVICE", "model.device"),
    ("WHISPER_UNLOAD_TIMEOUT", "lifecycle.unload_timeout_seconds"),
    ("WHISPER_SHUTDOWN_TIMEOUT", "lifecycle.shutdown_timeout_seconds"),
    ("WHISPER_PASSWORD", "auth.password"),
];

impl AppConfig {
    /// Load configuration from defaults, the optional config file and the
    /// process environment.
    pub fn load() -> Result<Self> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    /// Same as [`AppConfig::load`], reading deployment variables through
    /// `lookup`.
    ///
    /// ## Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from `config.*` (if it exists)
    /// 3. Override with `APP__`-prefixed environment variables
    /// 4. Apply the `WHISPER_*` / `HOST` / `PORT` overrides, later entries
    ///    in [`ENV_OVERRIDES`] winning
    pub fn load_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        for (variable, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(variable).filter(|v| !v.is_empty()) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup gives a clear message
    /// instead of a failure on the first request.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.server.max_upload_mb == 0 {
            return Err(anyhow!("Upload limit must be greater than 0"));
        }

        if self.model.name.trim().is_empty() {
            return Err(anyhow!("Model name cannot be empty"));
        }

        self.model
            .device
            .parse::<crate::device::DevicePreference>()?;
        crate::device::dtype_for(&self.model.compute_type, &candle_core::Device::Cpu)?;

        if self.lifecycle.unload_timeout_seconds == 0 {
            return Err(anyhow!("Unload timeout must be greater than 0"));
        }

        let shutdown = self.lifecycle.shutdown_timeout_seconds;
        if shutdown != SHUTDOWN_DISABLED && shutdown <= 0 {
            return Err(anyhow!(
                "Shutdown timeout must be -1 (disabled) or greater than 0, got {}",
                shutdown
            ));
        }

        if !(5..=10).contains(&self.lifecycle.reaper_interval_seconds) {
            return Err(anyhow!(
                "Reaper interval must be between 5 and 10 seconds, got {}",
                self.lifecycle.reaper_interval_seconds
            ));
        }

        if self.streaming.channel_capacity == 0 {
            return Err(anyhow!("Channel capacity must be greater than 0"));
        }

        if self.streaming.vad_min_silence_ms < 500 {
            return Err(anyhow!(
                "VAD minimum silence must be at least 500 ms, got {}",
                self.streaming.vad_min_silence_ms
            ));
        }

        Ok(())
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb * 1024 * 1024
    }

    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            model_name: self.model.name.clone(),
            compute_type: self.model.compute_type.clone(),
            device: self.model.device.clone(),
            cache_dir: self.model.cache_dir.as_ref().map(PathBuf::from),
        }
    }

    pub fn reaper_settings(&self) -> ReaperSettings {
        ReaperSettings::from_seconds(
            self.lifecycle.unload_timeout_seconds,
            self.lifecycle.shutdown_timeout_seconds,
            self.lifecycle.reaper_interval_seconds,
        )
    }

    pub fn streamer_options(&self) -> StreamerOptions {
        StreamerOptions {
            emit_deltas: self.streaming.emit_deltas,
            vad_min_silence_ms: self.streaming.vad_min_silence_ms,
        }
    }
}
