// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::thread;
use std::time::Duration;

use crate::dispatcher::{Dispatcher, ShutdownMode};
use crate::{Error, Result};

/// Owns a worker thread running a [`Dispatcher`].
///
/// [`Dispatcher::run()`] binds whatever thread calls it; the host is the
/// convenience for the common case of wanting a dedicated, named thread:
/// it spawns one, runs the dispatcher on it, and joins it on shutdown,
/// propagating the run outcome.
///
/// ```no_run
/// use usher::{Dispatcher, DispatcherHost, ShutdownMode};
///
/// let dispatcher = Dispatcher::new();
/// let host = DispatcherHost::start(dispatcher.clone())?;
///
/// let three = dispatcher.send(|| 1 + 2)?;
/// assert_eq!(three, 3);
///
/// host.shutdown(ShutdownMode::FinishPending)?;
/// # Ok::<(), usher::Error>(())
/// ```
#[derive(Debug)]
pub struct DispatcherHost {
    dispatcher: Dispatcher,
    worker: Option<thread::JoinHandle<Result<()>>>,
}

impl DispatcherHost {
    /// Spawns a worker thread for `dispatcher` and waits until it services
    /// submissions.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] when the dispatcher is already
    /// running, or with the run error when the worker terminates during
    /// startup.
    pub fn start(dispatcher: Dispatcher) -> Result<Self> {
        if dispatcher.is_running() {
            return Err(Error::invalid_state("dispatcher is already running"));
        }

        // Startup handshake: a parked no-op completes once the worker is
        // live and draining the queue.
        let ready = dispatcher.post(|| {})?;

        let worker = thread::Builder::new()
            .name("usher-worker".to_string())
            .spawn({
                let dispatcher = dispatcher.clone();
                move || dispatcher.run()
            })
            .expect("failed to spawn the dispatcher worker thread");

        loop {
            if ready.wait(Some(Duration::from_millis(10)))? {
                break;
            }

            if worker.is_finished() {
                return match worker.join() {
                    Ok(Ok(())) => Err(Error::invalid_state(
                        "worker terminated before servicing submissions",
                    )),
                    Ok(Err(error)) => Err(error),
                    Err(_) => Err(Error::invalid_state("worker thread panicked during startup")),
                };
            }
        }

        Ok(Self {
            dispatcher,
            worker: Some(worker),
        })
    }

    /// The hosted dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Shuts the dispatcher down with `mode` and joins the worker thread,
    /// returning the run outcome.
    ///
    /// # Errors
    ///
    /// Shutdown errors as [`Dispatcher::shutdown`]; the run outcome
    /// otherwise, including the wrapped body error of a dispatcher that
    /// terminated on a panic with `catch_exceptions` disabled.
    pub fn shutdown(mut self, mode: ShutdownMode) -> Result<()> {
        if self.dispatcher.is_in_thread() {
            return Err(Error::invalid_state(
                "the host cannot be shut down from the worker thread it owns",
            ));
        }

        match self.dispatcher.shutdown(mode) {
            Ok(()) => {}
            // Already shutting down, or the worker already terminated on its
            // own (e.g. a panicking body took it down); the join below
            // settles it either way and reports why.
            Err(Error::InvalidState(_)) => {}
            Err(error) => return Err(error),
        }

        self.join_worker()
    }

    fn join_worker(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        match worker.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::invalid_state("worker thread panicked")),
        }
    }
}

impl Drop for DispatcherHost {
    fn drop(&mut self) {
        if self.worker.is_some() {
            _ = self.dispatcher.begin_shutdown(ShutdownMode::DiscardPending);
            _ = self.join_worker();
        }
    }
}
