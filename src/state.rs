//! # Application State Management
//!
//! Everything the server shares across requests and background tasks lives
//! in one [`AppState`] value owned by `main` and handed to handlers through
//! `web::Data`. There are no module-level globals.
//!
//! ## Contents:
//! - **config**: Immutable after startup
//! - **activity**: The lock every transcription holds for its whole stream
//! - **models**: The lazily loaded speech model
//! - **streamer**: Event state machine bound to `models`
//! - **shutdown**: Cancelled by signals or by the idle reaper
//! - **metrics**: Request and transcription counters for `/metrics`
//!
//! Cloning an `AppState` is cheap: every field is an `Arc` or a handle.

use crate::config::AppConfig;
use crate::lifecycle::{ActivityLock, ModelManager};
use crate::transcription::model::ModelLoader;
use crate::transcription::streamer::{StreamOutcome, TranscriptionStreamer};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub activity: Arc<ActivityLock>,
    pub models: Arc<ModelManager>,
    pub streamer: Arc<TranscriptionStreamer>,
    pub shutdown: CancellationToken,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests and transcriptions.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: `"METHOD /path"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
    pub transcriptions: TranscriptionCounters,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// How transcription streams have ended since startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TranscriptionCounters {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl AppState {
    pub fn new(config: AppConfig, loader: Arc<dyn ModelLoader>, shutdown: CancellationToken) -> Self {
        let models = Arc::new(ModelManager::new(config.model_settings(), loader));
        let streamer = Arc::new(TranscriptionStreamer::new(
            Arc::clone(&models),
            config.streamer_options(),
        ));

        Self {
            config: Arc::new(config),
            activity: ActivityLock::new(),
            models,
            streamer,
            shutdown,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Record one finished HTTP request (called by the metrics middleware).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn transcription_started(&self) {
        self.metrics.write().transcriptions.started += 1;
    }

    pub fn transcription_finished(&self, outcome: &StreamOutcome) {
        let mut metrics = self.metrics.write();
        match outcome {
            StreamOutcome::Completed { .. } => metrics.transcriptions.completed += 1,
            StreamOutcome::Failed(_) => metrics.transcriptions.failed += 1,
            StreamOutcome::Cancelled => metrics.transcriptions.cancelled += 1,
        }
    }

    /// Copy of the current metrics, so no lock is held while responding.
    pub fn metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::transcription::testing::ScriptedLoader;

    fn state() -> AppState {
        AppState::new(
            AppConfig::default(),
            ScriptedLoader::new(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_transcription_outcomes_are_counted() {
        let state = state();
        state.transcription_started();
        state.transcription_finished(&StreamOutcome::Completed { segments: 2 });
        state.transcription_started();
        state.transcription_finished(&StreamOutcome::Failed(StreamError::ClientDisconnected));
        state.transcription_started();
        state.transcription_finished(&StreamOutcome::Cancelled);

        assert_eq!(
            state.metrics_snapshot().transcriptions,
            TranscriptionCounters {
                started: 3,
                completed: 1,
                failed: 1,
                cancelled: 1,
            }
        );
    }

    #[test]
    fn test_model_settings_come_from_config() {
        let state = state();
        assert_eq!(state.models.settings().model_name, "base");
        assert!(!state.models.is_loaded());
    }
}
