//! Cancellable single-shot timer used by the TCP/UDP channel state machines
//! to implement P2/P2*, the routing-activation timeout, and the vehicle
//! identification collection window.
//!
//! Built from a condvar rather than a dedicated thread: one reusable
//! primitive instead of a bespoke wait loop per state machine.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    /// Nobody is waiting and the timer hasn't fired
    Idle,
    /// A caller is blocked in [SyncTimer::wait_for_timeout]
    Armed,
    /// [SyncTimer::cancel] was called while armed
    Cancelled,
    /// [SyncTimer::cancel] was called before anyone had armed the timer yet;
    /// latched so the next [SyncTimer::wait_for_timeout] call returns
    /// `Cancelled` immediately instead of arming and waiting the full
    /// duration. Without this latch, a cancel that lands in the window
    /// between a state-machine transition and the following arm is silently
    /// lost.
    CancelPending,
}

/// A single-shot, cancellable wait with atomic "was it cancelled?" semantics:
/// a [SyncTimer::cancel] that arrives before the matching
/// [SyncTimer::wait_for_timeout] call is latched rather than dropped, so the
/// two can race without losing the wakeup. One `SyncTimer` is armed and
/// waited on at a time; arming a second wait while one is outstanding panics,
/// since the channel state machines that own a `SyncTimer` never do this
/// (each state machine is single-flight).
#[derive(Debug)]
pub struct SyncTimer {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Why [SyncTimer::wait_for_timeout] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full duration elapsed with no cancellation
    TimedOut,
    /// [SyncTimer::cancel] was called before the duration elapsed
    Cancelled,
}

impl Default for SyncTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTimer {
    /// Creates an idle timer.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimerState::Idle),
            cond: Condvar::new(),
        }
    }

    /// Arms the timer and blocks the calling thread for up to `duration`,
    /// waking early if [SyncTimer::cancel] is called from the reactor
    /// thread. Returns which of the two happened. If [SyncTimer::cancel] was
    /// already called since the last wait (the latched `CancelPending`
    /// state), returns `Cancelled` immediately without arming or blocking.
    pub fn wait_for_timeout(&self, duration: Duration) -> WaitOutcome {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == TimerState::CancelPending {
            *state = TimerState::Idle;
            return WaitOutcome::Cancelled;
        }
        assert_eq!(*state, TimerState::Idle, "SyncTimer is not single-flight safe");
        *state = TimerState::Armed;

        let deadline = Instant::now() + duration;
        while *state == TimerState::Armed {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, timeout_result) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            if timeout_result.timed_out() && *state == TimerState::Armed {
                break;
            }
        }

        let outcome = match *state {
            TimerState::Cancelled => WaitOutcome::Cancelled,
            _ => WaitOutcome::TimedOut,
        };
        *state = TimerState::Idle;
        outcome
    }

    /// Wakes a thread blocked in [SyncTimer::wait_for_timeout] early. If
    /// nothing is currently waiting, latches the cancellation so the next
    /// [SyncTimer::wait_for_timeout] call returns `Cancelled` immediately
    /// instead of missing it.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            TimerState::Armed => {
                *state = TimerState::Cancelled;
                self.cond.notify_all();
            }
            TimerState::Idle => {
                *state = TimerState::CancelPending;
            }
            TimerState::Cancelled | TimerState::CancelPending => {}
        }
    }
}

/// A bounded single-slot task queue used by the UDP channel to move outbound
/// transmission off the reactor's receive loop. Submitting a new task while
/// one is pending blocks until the worker drains the previous one, since the
/// UDP channel only ever has one outstanding vehicle-identification request
/// at a time.
pub struct Executor {
    sender: std::sync::mpsc::SyncSender<Box<dyn FnOnce() + Send + 'static>>,
    _worker: std::thread::JoinHandle<()>,
}

impl Executor {
    /// Spawns the worker thread backing this executor.
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = std::sync::mpsc::sync_channel::<Box<dyn FnOnce() + Send + 'static>>(1);
        let worker = std::thread::spawn(move || {
            while let Ok(task) = receiver.recv() {
                task();
            }
        });
        Arc::new(Self {
            sender,
            _worker: worker,
        })
    }

    /// Submits a task for execution on the worker thread. Blocks if a
    /// previous task hasn't been picked up yet.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(task));
    }
}
