//! Callout scheduler: the per-context timer thread
//!
//! A context schedules at most three kinds of timed work: its HELLO tick and,
//! per target, the handshake/keep-alive timeout and the send-data timeout.
//! Entries are held in a due-time-ordered list; the worker sleeps on a
//! condvar until the next due time (bounded to [1ms, 500ms]) or until a
//! schedule/cancel/shutdown pokes it. Fire callbacks run with the scheduler
//! mutex released because they re-enter the context through its event pipe.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::platform::Clock;
use crate::target::TargetKey;

// ----------------------------------------------------------------------------
// Callout Keys
// ----------------------------------------------------------------------------

/// Identity of a scheduled entry; one live entry per key at most
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CalloutKey {
    /// Context-level HELLO broadcast tick
    HelloTick,
    /// Handshake retry while in progress, keep-alive once established
    TargetTimeout(TargetKey),
    /// Ack timeout of an outstanding DATA send
    SendDataTimeout(TargetKey),
}

// ----------------------------------------------------------------------------
// Scheduler Errors
// ----------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum CalloutError {
    #[error("entry is already scheduled")]
    Duplicated,
    #[error("scheduler is not running")]
    NotRunning,
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Bounds on one condvar sleep
const MIN_SLEEP: Duration = Duration::from_millis(1);
const MAX_SLEEP: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct Entry {
    key: CalloutKey,
    exec_at: u64,
}

struct SchedulerState {
    /// Ascending by `exec_at`
    entries: Vec<Entry>,
    running: bool,
    should_exit: bool,
}

/// Due-time-ordered timer queue with a dedicated worker thread
pub(crate) struct CalloutScheduler {
    state: Mutex<SchedulerState>,
    condvar: Condvar,
    clock: Arc<dyn Clock>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CalloutScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedulerState {
                entries: Vec::new(),
                running: false,
                should_exit: false,
            }),
            condvar: Condvar::new(),
            clock,
            worker: Mutex::new(None),
        })
    }

    /// Spawn the worker; `fire` converts a due entry into a pipe event
    pub fn start(
        self: &Arc<Self>,
        fire: impl Fn(CalloutKey) + Send + 'static,
    ) -> std::io::Result<()> {
        let mut state = self.state.lock();
        state.running = true;
        state.should_exit = false;
        drop(state);

        let scheduler = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("adhoc-callout".into())
            .spawn(move || scheduler.run(fire))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Stop the worker, discard pending entries and join
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.should_exit = true;
            state.entries.clear();
        }
        self.condvar.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.state.lock().running = false;
    }

    /// Arm `key` to fire `delay_micros` from now
    pub fn schedule(&self, key: CalloutKey, delay_micros: u64) -> Result<(), CalloutError> {
        let mut state = self.state.lock();
        if !state.running || state.should_exit {
            return Err(CalloutError::NotRunning);
        }
        if state.entries.iter().any(|e| e.key == key) {
            return Err(CalloutError::Duplicated);
        }
        let exec_at = self.clock.now_micros() + delay_micros;
        let position = state
            .entries
            .iter()
            .position(|e| e.exec_at > exec_at)
            .unwrap_or(state.entries.len());
        state.entries.insert(position, Entry { key, exec_at });
        drop(state);
        self.condvar.notify_one();
        Ok(())
    }

    /// Disarm `key`; reports whether it was scheduled
    pub fn cancel(&self, key: CalloutKey) -> bool {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.key != key);
        let found = state.entries.len() != before;
        drop(state);
        if found {
            self.condvar.notify_one();
        }
        found
    }

    /// Cancel both per-target entries of `target`
    pub fn cancel_target(&self, target: TargetKey) {
        self.cancel(CalloutKey::TargetTimeout(target));
        self.cancel(CalloutKey::SendDataTimeout(target));
    }

    #[cfg(test)]
    fn is_scheduled(&self, key: CalloutKey) -> bool {
        self.state.lock().entries.iter().any(|e| e.key == key)
    }

    fn run(&self, fire: impl Fn(CalloutKey)) {
        tracing::trace!("callout worker up");
        let mut state = self.state.lock();
        loop {
            if state.should_exit {
                break;
            }

            let now = self.clock.now_micros();
            while let Some(first) = state.entries.first() {
                if first.exec_at > now || state.should_exit {
                    break;
                }
                let entry = state.entries.remove(0);
                // The callback writes into the event pipe and may re-enter
                // schedule(); it must not run under our mutex.
                drop(state);
                fire(entry.key);
                state = self.state.lock();
            }

            if state.should_exit {
                break;
            }

            let wait = match state.entries.first() {
                Some(next) => {
                    Duration::from_micros(next.exec_at.saturating_sub(self.clock.now_micros()))
                        .clamp(MIN_SLEEP, MAX_SLEEP)
                }
                None => MAX_SLEEP,
            };
            let _ = self.condvar.wait_for(&mut state, wait);
        }
        drop(state);
        tracing::trace!("callout worker down");
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
