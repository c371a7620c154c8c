//! # Activity Lock
//!
//! A process-wide mutual-exclusion lock that also remembers when it last
//! changed hands. Transcriptions hold it for their whole stream; the idle
//! reaper reads its timestamp to decide when the model may be reclaimed.
//!
//! ## Structure:
//! - **gate**: async mutex that serializes transcriptions (FIFO waiters)
//! - **state**: `{ held, last_change }`, guarded by its own small mutex so that
//!   readers always see a consistent pair
//!
//! Both the acquire and the release path update `state` while the gate is
//! held, so "not held" is never observed together with a stale holder.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct ActivityState {
    held: bool,
    last_change: Instant,
}

/// Idle-aware lock shared by the streaming endpoint and the idle reaper.
#[derive(Debug)]
pub struct ActivityLock {
    gate: Arc<AsyncMutex<()>>,
    state: Mutex<ActivityState>,
}

impl ActivityLock {
    /// Create an unheld lock stamped with the current time.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(AsyncMutex::new(())),
            state: Mutex::new(ActivityState {
                held: false,
                last_change: Instant::now(),
            }),
        })
    }

    /// Wait until no other holder exists, then mark the lock held.
    ///
    /// ## Behavior:
    /// - Waiters are queued by the async mutex in arrival order
    /// - The lock is not re-entrant: acquiring twice from one task deadlocks
    ///   that task until the first guard is dropped
    /// - Cancel-safe: dropping the future while waiting leaves no trace
    pub async fn acquire(self: &Arc<Self>) -> ActivityGuard {
        let permit = self.gate.clone().lock_owned().await;
        self.stamp(true);
        ActivityGuard {
            lock: Arc::clone(self),
            _permit: permit,
        }
    }

    /// Take the gate without waiting and without touching the timestamp,
    /// but only if the lock has been idle for longer than `timeout`.
    ///
    /// Used by the reaper so that nothing can start a transcription while
    /// the model is being dropped.
    pub fn try_idle(&self, timeout: Duration) -> Option<IdleGuard> {
        let permit = self.gate.clone().try_lock_owned().ok()?;
        if self.is_idle_for(timeout) {
            Some(IdleGuard { _permit: permit })
        } else {
            None
        }
    }

    /// True only when unheld AND the last change is older than `timeout`.
    pub fn is_idle_for(&self, timeout: Duration) -> bool {
        let state = *self.state.lock();
        !state.held && state.last_change.elapsed() > timeout
    }

    /// How long the lock has been free, or `None` while it is held.
    pub fn idle_duration(&self) -> Option<Duration> {
        let state = *self.state.lock();
        (!state.held).then(|| state.last_change.elapsed())
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    fn stamp(&self, held: bool) {
        let mut state = self.state.lock();
        state.held = held;
        state.last_change = Instant::now();
    }
}

/// Proof of exclusive access for one transcription. Releasing happens on drop.
#[derive(Debug)]
pub struct ActivityGuard {
    lock: Arc<ActivityLock>,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        // Stamp before the permit field is dropped and the gate opens.
        self.lock.stamp(false);
    }
}

/// Gate held by the reaper while it unloads; does not count as activity.
#[derive(Debug)]
pub struct IdleGuard {
    _permit: OwnedMutexGuard<()>,
}
