//! Auto-sync ticker: fires a callback at a fixed interval on a background
//! task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Callback invoked on every tick. Long work should be spawned, not done
/// inline, so a slow cycle cannot back the ticker up.
pub type TickCallback = Arc<dyn Fn() + Send + Sync>;

/// Owns the auto-sync timer task. One instance per sync engine; released in
/// the engine's `destroy()`.
pub struct SyncScheduler {
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
            task: Mutex::new(None),
        }
    }

    /// Start ticking. A second call replaces the previous timer.
    pub fn start(&self, tick: TickCallback) {
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                tick();
            }
        });
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn ticks_fire_repeatedly() {
        let scheduler = SyncScheduler::new(5);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        scheduler.start(Arc::new(move || {
            count_clone.fetch_add(1, Ordering::Relaxed);
        }));

        for _ in 0..200 {
            if count.load(Ordering::Relaxed) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(count.load(Ordering::Relaxed) >= 3);
        scheduler.stop();
    }

    #[tokio::test]
    async fn stop_halts_ticking() {
        let scheduler = SyncScheduler::new(5);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        scheduler.start(Arc::new(move || {
            count_clone.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop();
        assert!(!scheduler.is_running());

        let frozen = count.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(count.load(Ordering::Relaxed), frozen);
    }
}
