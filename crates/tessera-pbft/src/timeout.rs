//! Named one-shot timers.
//!
//! Every higher component detects stalls through a [`TimeoutScheduler`]:
//! client retries, the consensus-phase backstop of recovery. A timer is a
//! tokio task that sleeps and then runs its action.
//!
//! Invariants:
//! - at most one outstanding timer per operation id; starting an id that is
//!   already armed replaces the old timer
//! - a cancelled or replaced timer never runs its action, even if its sleep
//!   already elapsed (each entry carries a generation the task re-checks)
//! - a panicking action is caught and logged; the scheduler keeps working

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{Error, Result};

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    entries: Mutex<HashMap<String, TimerEntry>>,
    next_generation: AtomicU64,
}

impl Timers {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TimerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the entry if it is still the given generation.
    fn claim(&self, operation_id: &str, generation: u64) -> bool {
        let mut entries = self.lock();
        match entries.get(operation_id) {
            Some(entry) if entry.generation == generation => {
                entries.remove(operation_id);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
    }
}

/// Manager of named one-shot deadlines.
///
/// Clones share the same timers. Dropping the last clone aborts every
/// outstanding timer.
#[derive(Clone)]
pub struct TimeoutScheduler {
    runtime: Handle,
    timers: Arc<Timers>,
}

impl std::fmt::Debug for TimeoutScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutScheduler")
            .field("active", &self.active_count())
            .finish()
    }
}

impl TimeoutScheduler {
    /// Creates a scheduler that spawns its timers on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            timers: Arc::new(Timers::default()),
        }
    }

    /// Creates a scheduler on the runtime of the calling task.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| Error::NoRuntime)
    }

    /// Arms a one-shot timer for `operation_id`, replacing any existing one.
    ///
    /// A zero `duration` is a configuration mistake and is rejected.
    pub fn start<F>(&self, operation_id: impl Into<String>, duration: Duration, action: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let operation_id = operation_id.into();
        if duration.is_zero() {
            return Err(Error::invalid(format!(
                "timeout for {operation_id} must be positive"
            )));
        }

        let generation = self.timers.next_generation.fetch_add(1, Ordering::Relaxed);
        let timers: Weak<Timers> = Arc::downgrade(&self.timers);
        let task_id = operation_id.clone();

        // Spawned under the lock so the task cannot observe a missing entry
        let mut entries = self.timers.lock();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(duration).await;

            let Some(timers) = timers.upgrade() else {
                return;
            };
            if !timers.claim(&task_id, generation) {
                return;
            }
            drop(timers);

            tracing::trace!(operation = %task_id, "timeout fired");
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(action)) {
                tracing::error!(
                    operation = %task_id,
                    panic = panic_message(panic.as_ref()),
                    "timeout action panicked"
                );
            }
        });

        if let Some(previous) = entries.insert(operation_id, TimerEntry { generation, handle }) {
            previous.handle.abort();
        }
        Ok(())
    }

    /// Cancels the timer for `operation_id`. Returns true if one was armed.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.timers.lock().remove(operation_id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every outstanding timer.
    pub fn cancel_all(&self) {
        let drained: Vec<TimerEntry> = self.timers.lock().drain().map(|(_, e)| e).collect();
        if !drained.is_empty() {
            tracing::debug!(cancelled = drained.len(), "cancelled all timeouts");
        }
        for entry in drained {
            entry.handle.abort();
        }
    }

    pub fn is_active(&self, operation_id: &str) -> bool {
        self.timers.lock().contains_key(operation_id)
    }

    pub fn active_count(&self) -> usize {
        self.timers.lock().len()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let make = move || -> Box<dyn FnOnce() + Send> {
            let c = c.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, make)
    }

    #[test]
    fn current_outside_runtime_fails() {
        assert!(matches!(TimeoutScheduler::current(), Err(Error::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_and_removes_entry() {
        let scheduler = TimeoutScheduler::current().unwrap();
        let (count, make) = counter();

        scheduler.start("op", Duration::from_millis(100), make()).unwrap();
        assert!(scheduler.is_active("op"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_active("op"));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_existing_timer() {
        let scheduler = TimeoutScheduler::current().unwrap();
        let (count, make) = counter();

        scheduler.start("op", Duration::from_millis(100), make()).unwrap();
        scheduler.start("op", Duration::from_millis(300), make()).unwrap();
        assert_eq!(scheduler.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let scheduler = TimeoutScheduler::current().unwrap();
        let (count, make) = counter();

        scheduler.start("op", Duration::from_millis(100), make()).unwrap();
        assert!(scheduler.cancel("op"));
        assert!(!scheduler.cancel("op"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_everything() {
        let scheduler = TimeoutScheduler::current().unwrap();
        let (count, make) = counter();

        for i in 0..5 {
            scheduler.start(format!("op-{i}"), Duration::from_millis(50), make()).unwrap();
        }
        assert_eq!(scheduler.active_count(), 5);
        scheduler.cancel_all();
        assert_eq!(scheduler.active_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_action_does_not_break_scheduler() {
        let scheduler = TimeoutScheduler::current().unwrap();
        let (count, make) = counter();

        scheduler
            .start("bad", Duration::from_millis(10), || panic!("boom"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!scheduler.is_active("bad"));

        scheduler.start("good", Duration::from_millis(10), make()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn action_may_rearm_its_own_id() {
        let scheduler = TimeoutScheduler::current().unwrap();
        let (count, _) = counter();

        let again = scheduler.clone();
        let c = count.clone();
        scheduler
            .start("loop", Duration::from_millis(10), move || {
                c.fetch_add(1, Ordering::SeqCst);
                let c = c.clone();
                again
                    .start("loop", Duration::from_millis(10), move || {
                        c.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_active("loop"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_is_rejected() {
        let scheduler = TimeoutScheduler::current().unwrap();
        assert!(matches!(
            scheduler.start("op", Duration::ZERO, || {}),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_scheduler_aborts_timers() {
        let scheduler = TimeoutScheduler::current().unwrap();
        let (count, make) = counter();
        scheduler.start("op", Duration::from_millis(10), make()).unwrap();
        drop(scheduler);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
