// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::dispatcher::{DispatcherCore, KeepAlive, OperationTemplate};
use crate::operation::Operation;
use crate::{ERR_POISONED_LOCK, Error, Result};

/// Whether a timer fires once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fire once after the interval, then stop.
    OneShot,
    /// Fire every interval until stopped.
    Periodic,
}

/// Submits operations into its dispatcher on a schedule.
///
/// Created stopped by [`post_delayed`][crate::Dispatcher::post_delayed] and
/// armed with [`start()`][Self::start]. Every fire builds a fresh operation
/// from the template bound at creation time - same body factory, priority,
/// options and captured context.
///
/// # At most one outstanding operation
///
/// A fire that finds the previously submitted operation still live (waiting
/// or executing) submits nothing and counts a miss instead. At no point are
/// two operations of the same timer live concurrently; `execution_count`
/// plus `miss_count` equals the number of fires that happened while the
/// dispatcher was running.
///
/// # Precision
///
/// Fires are scheduled by a dedicated thread sleeping the interval between
/// them; there are no guarantees about precision beyond eventual firing, and
/// no attempt is made to compensate for drift.
#[derive(Debug, Clone)]
pub struct DispatchTimer {
    core: Arc<TimerCore>,
}

pub(crate) struct TimerCore {
    dispatcher: Weak<DispatcherCore>,
    mode: TimerMode,
    template: OperationTemplate,
    state: Mutex<TimerState>,
    armed: Condvar,
}

#[derive(Debug)]
struct TimerState {
    running: bool,
    /// Bumped on every start and stop; a timer thread that observes a
    /// foreign epoch has been superseded and exits silently.
    epoch: u64,
    interval: Duration,
    execution_count: u64,
    miss_count: u64,
    previous_operation: Option<Operation>,
}

/// What the timer thread does after a fire.
enum AfterFire {
    Continue,
    Stop,
}

impl DispatchTimer {
    pub(crate) fn new(
        dispatcher: Weak<DispatcherCore>,
        mode: TimerMode,
        interval: Duration,
        template: OperationTemplate,
    ) -> Self {
        Self {
            core: Arc::new(TimerCore {
                dispatcher,
                mode,
                template,
                state: Mutex::new(TimerState {
                    running: false,
                    epoch: 0,
                    interval,
                    execution_count: 0,
                    miss_count: 0,
                    previous_operation: None,
                }),
                armed: Condvar::new(),
            }),
        }
    }

    /// Arms the timer: the first fire happens after `interval`.
    ///
    /// Resets `execution_count` and `miss_count` and registers the timer in
    /// the dispatcher's keep-alive set.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] for a zero interval and with
    /// [`Error::InvalidState`] when already running or when the dispatcher
    /// is not running.
    pub fn start(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::invalid_argument(
                "timer interval must be strictly positive",
            ));
        }

        let Some(dispatcher) = self.core.dispatcher.upgrade() else {
            return Err(Error::invalid_state(
                "the dispatcher of this timer no longer exists",
            ));
        };

        let epoch = {
            let mut state = self.core.state.lock().expect(ERR_POISONED_LOCK);

            if state.running {
                return Err(Error::invalid_state("timer is already running"));
            }

            state.running = true;
            state.epoch = state.epoch.wrapping_add(1);
            state.interval = interval;
            state.execution_count = 0;
            state.miss_count = 0;
            state.epoch
        };

        if !dispatcher.add_keep_alive(KeepAlive::Timer(self.clone())) {
            self.core.state.lock().expect(ERR_POISONED_LOCK).running = false;
            return Err(Error::invalid_state("dispatcher is not running"));
        }

        let core = Arc::clone(&self.core);
        _ = thread::Builder::new()
            .name("usher-timer".to_string())
            .spawn(move || core.run(epoch))
            .expect("failed to spawn the timer thread");

        Ok(())
    }

    /// Disarms the timer and removes it from the dispatcher's keep-alive
    /// set. Returns whether it was running. An operation already submitted
    /// is unaffected.
    pub fn stop(&self) -> bool {
        let was_running = {
            let mut state = self.core.state.lock().expect(ERR_POISONED_LOCK);

            let was_running = state.running;
            state.running = false;
            state.epoch = state.epoch.wrapping_add(1);
            was_running
        };

        self.core.armed.notify_all();

        if let Some(dispatcher) = self.core.dispatcher.upgrade() {
            _ = dispatcher.remove_keep_alive(&KeepAlive::Timer(self.clone()));
        }

        was_running
    }

    /// Stops, then starts with `interval`.
    ///
    /// # Errors
    ///
    /// As [`start`][Self::start].
    pub fn restart(&self, interval: Duration) -> Result<()> {
        _ = self.stop();
        self.start(interval)
    }

    /// Whether this timer fires once or repeatedly.
    #[must_use]
    pub fn mode(&self) -> TimerMode {
        self.core.mode
    }

    /// Whether the timer is armed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.state.lock().expect(ERR_POISONED_LOCK).running
    }

    /// The interval the timer is (or was last) armed with.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.core.state.lock().expect(ERR_POISONED_LOCK).interval
    }

    /// Fires that submitted an operation since the last start.
    #[must_use]
    pub fn execution_count(&self) -> u64 {
        self.core.state.lock().expect(ERR_POISONED_LOCK).execution_count
    }

    /// Fires that were skipped because the previous operation was still live.
    #[must_use]
    pub fn miss_count(&self) -> u64 {
        self.core.state.lock().expect(ERR_POISONED_LOCK).miss_count
    }

    /// The most recently submitted operation, if any.
    #[must_use]
    pub fn previous_operation(&self) -> Option<Operation> {
        self.core
            .state
            .lock()
            .expect(ERR_POISONED_LOCK)
            .previous_operation
            .clone()
    }

    pub(crate) fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl TimerCore {
    /// Timer thread entrypoint: sleep one interval, fire, repeat. Exits when
    /// stopped, superseded by a restart, or told to by the fire contract.
    #[cfg_attr(test, mutants::skip)] // Timing loop - mutations turn into hangs.
    fn run(self: Arc<Self>, epoch: u64) {
        loop {
            let after = {
                let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

                let Some(deadline) = Instant::now().checked_add(state.interval) else {
                    return;
                };

                loop {
                    if !state.running || state.epoch != epoch {
                        return;
                    }

                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }

                    let (guard, _) = self
                        .armed
                        .wait_timeout(state, deadline.duration_since(now))
                        .expect(ERR_POISONED_LOCK);
                    state = guard;
                }

                match self.fire(&mut state) {
                    AfterFire::Continue => AfterFire::Continue,
                    AfterFire::Stop => {
                        state.running = false;
                        AfterFire::Stop
                    }
                }
            };

            if matches!(after, AfterFire::Stop) {
                if let Some(dispatcher) = self.dispatcher.upgrade() {
                    _ = dispatcher.remove_keep_alive(&KeepAlive::Timer(DispatchTimer {
                        core: Arc::clone(&self),
                    }));
                }

                return;
            }
        }
    }

    /// One fire, under the timer lock:
    ///
    /// 1. (Stopped timers never get here - the caller checked.)
    /// 2. A still-live previous operation means this fire is a miss.
    /// 3. Otherwise submit a fresh operation from the template, if the
    ///    dispatcher currently accepts work.
    /// 4. One-shot timers and timers whose dispatcher went away stop.
    fn fire(&self, state: &mut TimerState) -> AfterFire {
        if let Some(previous) = &state.previous_operation
            && !previous.state().is_terminal()
        {
            state.miss_count = state.miss_count.saturating_add(1);

            return match self.mode {
                TimerMode::Periodic => AfterFire::Continue,
                TimerMode::OneShot => AfterFire::Stop,
            };
        }

        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return AfterFire::Stop;
        };

        match dispatcher.submit_from_template(&self.template) {
            Some(operation) => {
                state.previous_operation = Some(operation);
                state.execution_count = state.execution_count.saturating_add(1);

                match self.mode {
                    TimerMode::Periodic => AfterFire::Continue,
                    TimerMode::OneShot => AfterFire::Stop,
                }
            }
            // The dispatcher is not running (or refuses new work); the
            // timer has nothing left to do.
            None => AfterFire::Stop,
        }
    }
}

impl fmt::Debug for TimerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerCore")
            .field("mode", &self.mode)
            .field("state", &self.state.lock().expect(ERR_POISONED_LOCK))
            .finish_non_exhaustive()
    }
}
