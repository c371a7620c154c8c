//! # Model Lifecycle Manager
//!
//! Owns the (possibly absent) loaded speech model.
//!
//! ## State Transitions:
//! Unloaded → Loaded on the first `load()`, Loaded → Unloaded on `unload()`,
//! and back to Loaded on the next `load()`. A failed construction leaves the
//! manager Unloaded so the next request simply retries.
//!
//! ## Admission control:
//! `load()` must only be called while the caller holds the activity lock.
//! That lock is what prevents two concurrent constructions; the slot mutex
//! below only protects the pointer itself and is never held while a model
//! is being built.

use crate::transcription::model::{ModelLoader, ModelSettings, SpeechModel};
use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters exposed on the metrics endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ModelStats {
    pub loads: u64,
    pub load_failures: u64,
    pub unloads: u64,
}

pub struct ModelManager {
    settings: ModelSettings,
    loader: Arc<dyn ModelLoader>,
    slot: Mutex<Option<Arc<dyn SpeechModel>>>,
    loads: AtomicU64,
    load_failures: AtomicU64,
    unloads: AtomicU64,
}

impl ModelManager {
    pub fn new(settings: ModelSettings, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            settings,
            loader,
            slot: Mutex::new(None),
            loads: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            unloads: AtomicU64::new(0),
        }
    }

    /// Return the loaded model, constructing it first if necessary.
    pub fn load(&self) -> Result<Arc<dyn SpeechModel>> {
        if let Some(model) = self.slot.lock().as_ref() {
            return Ok(Arc::clone(model));
        }

        tracing::info!(
            model = %self.settings.model_name,
            compute_type = %self.settings.compute_type,
            device = %self.settings.device,
            "Loading speech model"
        );
        let start_time = Instant::now();

        let model = match self.loader.load(&self.settings) {
            Ok(model) => model,
            Err(e) => {
                self.load_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(model = %self.settings.model_name, "Model load failed: {:#}", e);
                return Err(e);
            }
        };

        *self.slot.lock() = Some(Arc::clone(&model));
        self.loads.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Model {} loaded in {:.2}s",
            self.settings.model_name,
            start_time.elapsed().as_secs_f64()
        );
        Ok(model)
    }

    /// Drop the model instance. Returns whether there was one.
    pub fn unload(&self) -> bool {
        let previous = self.slot.lock().take();
        match previous {
            Some(model) => {
                // Release the slot lock before the (potentially slow) drop.
                drop(model);
                self.unloads.fetch_add(1, Ordering::Relaxed);
                tracing::info!(model = %self.settings.model_name, "Model unloaded from memory");
                true
            }
            None => false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn stats(&self) -> ModelStats {
        ModelStats {
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            unloads: self.unloads.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::testing::{settings, ScriptedLoader};

    #[test]
    fn test_load_is_idempotent() {
        let loader = ScriptedLoader::new();
        let manager = ModelManager::new(settings(), loader.clone());

        assert!(!manager.is_loaded());
        manager.load().unwrap();
        manager.load().unwrap();
        assert!(manager.is_loaded());
        assert_eq!(loader.constructions(), 1);
        assert_eq!(manager.stats().loads, 1);
    }

    #[test]
    fn test_unload_then_reload_constructs_again() {
        let loader = ScriptedLoader::new();
        let manager = ModelManager::new(settings(), loader.clone());

        manager.load().unwrap();
        assert!(manager.unload());
        assert!(!manager.is_loaded());
        assert!(!manager.unload());

        manager.load().unwrap();
        assert_eq!(loader.constructions(), 2);
        assert_eq!(manager.stats().unloads, 1);
    }

    #[test]
    fn test_failed_load_leaves_manager_unloaded_for_retry() {
        let loader = ScriptedLoader::new();
        loader.fail_next_load("weights missing");
        let manager = ModelManager::new(settings(), loader.clone());

        let err = manager.load().err().unwrap();
        assert!(err.to_string().contains("weights missing"));
        assert!(!manager.is_loaded());
        assert_eq!(manager.stats().load_failures, 1);

        manager.load().unwrap();
        assert!(manager.is_loaded());
    }
}
