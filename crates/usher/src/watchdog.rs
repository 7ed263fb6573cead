// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::events::{EventHandlers, WatchdogEvent};
use crate::operation::Operation;
use crate::ERR_POISONED_LOCK;

/// Sampling interval of the monitor loop.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

/// Observes the operation currently executing on the worker thread and
/// raises an advisory event when it accumulates more body time than the
/// configured threshold since the last event.
///
/// The worker maintains a LIFO surveillance stack mirroring its execution
/// stack: reentrant frames push the nested operation on top, and only the
/// top entry accrues time. The watchdog never interrupts an operation; it
/// only reports.
///
/// # Thread safety
///
/// `start_surveillance`/`stop_surveillance` are only ever called by the
/// worker thread; the sampling loop runs on a dedicated monitor thread.
#[derive(Debug)]
pub(crate) struct Watchdog {
    shared: Arc<WatchdogShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

#[derive(Debug)]
struct WatchdogShared {
    /// The threshold, when surveillance is enabled. `None` disables sampling
    /// entirely (the stack is still maintained).
    timeout: Option<Duration>,
    events: Arc<EventHandlers>,
    state: Mutex<WatchState>,
    tick: Condvar,
}

#[derive(Debug)]
struct WatchState {
    entries: Vec<WatchEntry>,
    stop: bool,
}

#[derive(Debug)]
struct WatchEntry {
    operation: Operation,
    last_check_at: Instant,
}

impl Watchdog {
    pub fn new(timeout: Option<Duration>, events: Arc<EventHandlers>) -> Self {
        Self {
            shared: Arc::new(WatchdogShared {
                timeout,
                events,
                state: Mutex::new(WatchState {
                    entries: Vec::new(),
                    stop: false,
                }),
                tick: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Starts the monitor thread. Called by the dispatcher when the worker
    /// binds; may be called again after [`stop()`][Self::stop].
    pub fn start(&self) {
        let mut thread = self.thread.lock().expect(ERR_POISONED_LOCK);
        assert!(thread.is_none(), "watchdog started while already running");

        {
            let mut state = self.shared.state.lock().expect(ERR_POISONED_LOCK);
            state.stop = false;
            debug_assert!(state.entries.is_empty(), "stale surveillance entries");
        }

        let shared = Arc::clone(&self.shared);
        *thread = Some(
            thread::Builder::new()
                .name("usher-watchdog".to_string())
                .spawn(move || shared.run())
                .expect("failed to spawn the watchdog thread"),
        );
    }

    /// Stops the monitor thread and joins it.
    pub fn stop(&self) {
        let Some(handle) = self.thread.lock().expect(ERR_POISONED_LOCK).take() else {
            return;
        };

        {
            let mut state = self.shared.state.lock().expect(ERR_POISONED_LOCK);
            state.stop = true;
        }
        self.shared.tick.notify_all();

        _ = handle.join();
    }

    /// Puts `operation` under surveillance, on top of the stack.
    pub fn start_surveillance(&self, operation: &Operation) {
        let mut state = self.shared.state.lock().expect(ERR_POISONED_LOCK);

        state.entries.push(WatchEntry {
            operation: operation.clone(),
            last_check_at: Instant::now(),
        });
    }

    /// Removes `operation` from surveillance. It must be the top entry.
    ///
    /// # Panics
    ///
    /// Panics when the surveillance stack does not have `operation` on top -
    /// that is a worker protocol violation which must not go unnoticed.
    pub fn stop_surveillance(&self, operation: &Operation) {
        let mut state = self.shared.state.lock().expect(ERR_POISONED_LOCK);

        let entry = state
            .entries
            .pop()
            .expect("surveillance stopped on an empty stack");
        assert!(
            entry.operation.is_same(operation),
            "surveillance stack out of sync: the stopped operation is not the most recently started one"
        );
    }
}

impl WatchdogShared {
    #[cfg_attr(test, mutants::skip)] // Timing loop - mutations turn into hangs.
    fn run(&self) {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        loop {
            if state.stop {
                return;
            }

            if let Some(timeout) = self.timeout
                && let Some(top) = state.entries.last_mut()
            {
                let now = Instant::now();
                let delta = now.duration_since(top.last_check_at);
                top.last_check_at = now;

                if let Some(total_events) = top.operation.add_sampled_time(delta, timeout) {
                    let event = WatchdogEvent {
                        operation: top.operation.clone(),
                        timeout,
                    };

                    // Handlers run without the surveillance lock so they may
                    // inspect the dispatcher freely.
                    drop(state);

                    warn!(
                        watchdog_events = total_events,
                        ?timeout,
                        "operation exceeded the watchdog threshold and is still executing"
                    );
                    self.events.raise_watchdog(&event);

                    state = self.state.lock().expect(ERR_POISONED_LOCK);
                    continue;
                }
            }

            let (guard, _) = self
                .tick
                .wait_timeout(state, SAMPLE_INTERVAL)
                .expect(ERR_POISONED_LOCK);
            state = guard;
        }
    }
}
