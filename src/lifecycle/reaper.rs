//! # Idle Reaper
//!
//! Background task that wakes on a fixed interval and reclaims resources
//! when nothing has used the server for a while.
//!
//! ## Each Tick:
//! 1. If a model is loaded and the activity lock has been idle longer than
//!    the unload timeout, drop the model
//! 2. If an idle shutdown timeout is configured and has been exceeded,
//!    cancel the process-wide shutdown token
//!
//! Both checks are independent and may fire in the same tick.

use crate::lifecycle::activity::ActivityLock;
use crate::lifecycle::manager::ModelManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Timing parameters for the reaper.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReaperSettings {
    pub unload_after: Duration,
    /// `None` disables idle shutdown.
    pub shutdown_after: Option<Duration>,
    pub interval: Duration,
}

impl ReaperSettings {
    /// Build from the config's second-based values; a negative shutdown
    /// timeout disables idle shutdown.
    pub fn from_seconds(unload: u64, shutdown: i64, interval: u64) -> Self {
        Self {
            unload_after: Duration::from_secs(unload),
            shutdown_after: u64::try_from(shutdown).ok().map(Duration::from_secs),
            interval: Duration::from_secs(interval),
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub unloaded: bool,
    pub shutdown_requested: bool,
}

pub struct IdleReaper {
    activity: Arc<ActivityLock>,
    models: Arc<ModelManager>,
    settings: ReaperSettings,
    shutdown: CancellationToken,
}

impl IdleReaper {
    pub fn new(
        activity: Arc<ActivityLock>,
        models: Arc<ModelManager>,
        settings: ReaperSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            activity,
            models,
            settings,
            shutdown,
        }
    }

    /// Start the reaper on the current runtime. It stops once the shutdown
    /// token is cancelled, whoever cancelled it.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::info!(
            unload_after_secs = self.settings.unload_after.as_secs(),
            shutdown_after_secs = ?self.settings.shutdown_after.map(|d| d.as_secs()),
            interval_secs = self.settings.interval.as_secs(),
            "Idle reaper started"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        tracing::debug!("Idle reaper stopped");
    }

    /// Run both idle checks once.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        if self.models.is_loaded() {
            // Holding the gate keeps a new transcription from loading the
            // model while it is being dropped.
            if let Some(_idle) = self.activity.try_idle(self.settings.unload_after) {
                tracing::info!(
                    "Model idle for more than {}s, unloading",
                    self.settings.unload_after.as_secs()
                );
                report.unloaded = self.models.unload();
            }
        }

        if let Some(limit) = self.settings.shutdown_after {
            if !self.shutdown.is_cancelled() && self.activity.is_idle_for(limit) {
                tracing::info!(
                    "Server idle for more than {}s, shutting down",
                    limit.as_secs()
                );
                self.shutdown.cancel();
                report.shutdown_requested = true;
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::testing::{settings, ScriptedLoader};

    fn fixture(shutdown_secs: i64) -> (Arc<ActivityLock>, Arc<ModelManager>, CancellationToken, IdleReaper) {
        let activity = ActivityLock::new();
        let models = Arc::new(ModelManager::new(settings(), ScriptedLoader::new()));
        let shutdown = CancellationToken::new();
        let reaper = IdleReaper::new(
            Arc::clone(&activity),
            Arc::clone(&models),
            ReaperSettings::from_seconds(60, shutdown_secs, 10),
            shutdown.clone(),
        );
        (activity, models, shutdown, reaper)
    }

    #[test]
    fn test_negative_shutdown_timeout_disables_shutdown() {
        let settings = ReaperSettings::from_seconds(60, -1, 10);
        assert_eq!(settings.shutdown_after, None);
        let settings = ReaperSettings::from_seconds(60, 0, 10);
        assert_eq!(settings.shutdown_after, Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unloads_only_after_timeout() {
        let (_activity, models, _shutdown, reaper) = fixture(-1);
        models.load().unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(reaper.tick(), TickReport::default());
        assert!(models.is_loaded());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(reaper.tick().unloaded);
        assert!(!models.is_loaded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_unloads_while_transcription_holds_lock() {
        let (activity, models, _shutdown, reaper) = fixture(-1);
        models.load().unwrap();

        let guard = activity.acquire().await;
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(!reaper.tick().unloaded);
        assert!(models.is_loaded());
        drop(guard);

        // Release restarts the idle clock.
        assert!(!reaper.tick().unloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_and_shutdown_in_same_tick() {
        let (_activity, models, shutdown, reaper) = fixture(120);
        models.load().unwrap();

        tokio::time::advance(Duration::from_secs(121)).await;
        let report = reaper.tick();
        assert!(report.unloaded);
        assert!(report.shutdown_requested);
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reaper_unloads_within_one_interval() {
        let (_activity, models, shutdown, reaper) = fixture(-1);
        models.load().unwrap();
        let handle = reaper.spawn();

        // Threshold is crossed at 60s; the next tick (70s) must unload.
        tokio::time::sleep(Duration::from_secs(71)).await;
        assert!(!models.is_loaded());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reaper_requests_idle_shutdown() {
        let (_activity, _models, shutdown, reaper) = fixture(25);
        let handle = reaper.spawn();

        tokio::time::timeout(Duration::from_secs(40), shutdown.cancelled())
            .await
            .unwrap();
        handle.await.unwrap();
    }
}
