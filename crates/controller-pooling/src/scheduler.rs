//! State timers
//!
//! Timers run as tokio tasks on the runtime captured when the manager was
//! built. A firing timer only reaches the current state if it is still
//! registered and was scheduled in the current generation; every state change
//! starts a new generation and cancels everything scheduled before it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What a timer is for; passed back to the state when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Start: own heartbeat not seen yet
    StartHeartbeat,
    /// Query, Active: identification window closed
    IdentificationWindow,
    /// Inactive: no leader traffic for too long
    Reactivate,
    /// Active: periodic heartbeat on the admin channel
    LeaderHeartbeat,
    /// Active: periodic check that our own traffic is echoed back
    ActiveCheck,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerKind::StartHeartbeat => "start-heartbeat",
            TimerKind::IdentificationWindow => "identification-window",
            TimerKind::Reactivate => "reactivate",
            TimerKind::LeaderHeartbeat => "leader-heartbeat",
            TimerKind::ActiveCheck => "active-check",
        };
        f.write_str(name)
    }
}

/// Callback invoked from the timer task: `(timer, kind, generation)`
pub type TimerSink = Arc<dyn Fn(TimerId, TimerKind, u64) + Send + Sync>;

struct Timer {
    generation: u64,
    repeating: bool,
    task: JoinHandle<()>,
}

/// Per-manager timer registry
pub struct Scheduler {
    runtime: Handle,
    sink: TimerSink,
    generation: u64,
    next_id: u64,
    timers: HashMap<TimerId, Timer>,
}

impl Scheduler {
    pub fn new(runtime: Handle, sink: TimerSink) -> Self {
        Self {
            runtime,
            sink,
            generation: 0,
            next_id: 1,
            timers: HashMap::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of live timers
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Fire `kind` once after `delay`
    pub fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        let id = self.allocate();
        let generation = self.generation;
        let sink = Arc::clone(&self.sink);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            sink(id, kind, generation);
        });
        self.timers.insert(
            id,
            Timer {
                generation,
                repeating: false,
                task,
            },
        );
        id
    }

    /// Fire `kind` after `initial`, then every `period` until cancelled
    pub fn schedule_with_fixed_delay(
        &mut self,
        initial: Duration,
        period: Duration,
        kind: TimerKind,
    ) -> TimerId {
        let id = self.allocate();
        let generation = self.generation;
        let sink = Arc::clone(&self.sink);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(initial).await;
            loop {
                sink(id, kind, generation);
                tokio::time::sleep(period).await;
            }
        });
        self.timers.insert(
            id,
            Timer {
                generation,
                repeating: true,
                task,
            },
        );
        id
    }

    /// Cancel a timer; returns false if it already fired or was cancelled
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer and open a new generation
    pub fn reset(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
        self.generation += 1;
    }

    /// Decide whether a firing timer may reach the current state.
    ///
    /// One-shot timers are unregistered when accepted.
    pub fn accept(&mut self, id: TimerId, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        match self.timers.get(&id) {
            Some(timer) if timer.generation == generation => {
                if !timer.repeating {
                    self.timers.remove(&id);
                }
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_ids(&self) -> Vec<TimerId> {
        self.timers.keys().copied().collect()
    }

    fn allocate(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("generation", &self.generation)
            .field("pending", &self.timers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Fired = Arc<Mutex<Vec<(TimerId, TimerKind, u64)>>>;

    fn recording_scheduler() -> (Scheduler, Fired) {
        let fired: Fired = Arc::new(Mutex::new(Vec::new()));
        let sink_fired = Arc::clone(&fired);
        let sink: TimerSink = Arc::new(move |id: TimerId, kind: TimerKind, generation: u64| {
            sink_fired.lock().push((id, kind, generation));
        });
        (Scheduler::new(Handle::current(), sink), fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let (mut scheduler, fired) = recording_scheduler();
        let id = scheduler.schedule(Duration::from_millis(100), TimerKind::Reactivate);

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(fired.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let events = fired.lock().clone();
        assert_eq!(events, vec![(id, TimerKind::Reactivate, 0)]);

        assert!(scheduler.accept(id, 0));
        assert!(!scheduler.accept(id, 0), "one-shot is consumed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_repeats() {
        let (mut scheduler, fired) = recording_scheduler();
        let id = scheduler.schedule_with_fixed_delay(
            Duration::from_millis(10),
            Duration::from_millis(100),
            TimerKind::LeaderHeartbeat,
        );

        tokio::time::sleep(Duration::from_millis(315)).await;
        assert_eq!(fired.lock().len(), 4);
        assert!(scheduler.accept(id, 0));
        assert!(scheduler.accept(id, 0), "repeating timers stay registered");

        assert!(scheduler.cancel(id));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_invalidates_previous_generation() {
        let (mut scheduler, fired) = recording_scheduler();
        let old = scheduler.schedule(Duration::from_millis(50), TimerKind::StartHeartbeat);
        scheduler.reset();
        assert_eq!(scheduler.generation(), 1);
        assert_eq!(scheduler.pending(), 0);
        assert!(!scheduler.accept(old, 0));

        let new = scheduler.schedule(Duration::from_millis(50), TimerKind::IdentificationWindow);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = fired.lock().clone();
        assert_eq!(events, vec![(new, TimerKind::IdentificationWindow, 1)]);
        assert!(scheduler.accept(new, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unknown() {
        let (mut scheduler, _fired) = recording_scheduler();
        let id = scheduler.schedule(Duration::from_secs(1), TimerKind::ActiveCheck);
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
    }
}
