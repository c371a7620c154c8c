//! # Model Lifecycle
//!
//! Keeps the speech model in memory only while it is being used.
//!
//! ## Key Components:
//! - **Activity Lock**: Serializes transcriptions and tracks idle time
//! - **Model Manager**: Lazily constructs and drops the model
//! - **Idle Reaper**: Background task that unloads an idle model and can
//!   trigger an idle shutdown

pub mod activity;    // Idle-aware mutual exclusion
pub mod manager;     // Load/unload of the model instance
pub mod reaper;      // Periodic idle check

pub use activity::ActivityLock;
pub use manager::ModelManager;
pub use reaper::IdleReaper;
