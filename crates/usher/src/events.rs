// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::operation::Operation;
use crate::ERR_POISONED_LOCK;

/// Raised whenever an operation body panics, regardless of the
/// `catch_exceptions` setting. Raised on the worker thread.
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    /// The operation whose body panicked.
    pub operation: Operation,
    /// Message extracted from the panic payload.
    pub message: String,
    /// Whether the dispatcher keeps running (`catch_exceptions` was set).
    pub can_continue: bool,
}

/// Raised from the watchdog thread when the currently executing operation
/// exceeded the configured threshold since the last event. Advisory only -
/// the operation is not interrupted.
#[derive(Debug, Clone)]
pub struct WatchdogEvent {
    /// The operation under surveillance.
    pub operation: Operation,
    /// The configured watchdog timeout that was exceeded.
    pub timeout: Duration,
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Subscriber lists for the dispatcher events. Handlers are cloned out of
/// the lists before invocation so they run without any dispatcher lock held
/// and may themselves subscribe or submit.
#[derive(Default)]
pub(crate) struct EventHandlers {
    exception: Mutex<Vec<Handler<ExceptionEvent>>>,
    watchdog: Mutex<Vec<Handler<WatchdogEvent>>>,
    idle: Mutex<Vec<Handler<Dispatcher>>>,
}

impl EventHandlers {
    pub fn subscribe_exception(&self, handler: impl Fn(&ExceptionEvent) + Send + Sync + 'static) {
        self.exception
            .lock()
            .expect(ERR_POISONED_LOCK)
            .push(Arc::new(handler));
    }

    pub fn subscribe_watchdog(&self, handler: impl Fn(&WatchdogEvent) + Send + Sync + 'static) {
        self.watchdog
            .lock()
            .expect(ERR_POISONED_LOCK)
            .push(Arc::new(handler));
    }

    pub fn subscribe_idle(&self, handler: impl Fn(&Dispatcher) + Send + Sync + 'static) {
        self.idle
            .lock()
            .expect(ERR_POISONED_LOCK)
            .push(Arc::new(handler));
    }

    pub fn raise_exception(&self, event: &ExceptionEvent) {
        for handler in self.handlers(&self.exception) {
            handler(event);
        }
    }

    pub fn raise_watchdog(&self, event: &WatchdogEvent) {
        for handler in self.handlers(&self.watchdog) {
            handler(event);
        }
    }

    pub fn raise_idle(&self, dispatcher: &Dispatcher) {
        for handler in self.handlers(&self.idle) {
            handler(dispatcher);
        }
    }

    fn handlers<E>(&self, list: &Mutex<Vec<Handler<E>>>) -> Vec<Handler<E>> {
        list.lock().expect(ERR_POISONED_LOCK).clone()
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field(
                "exception",
                &self.exception.lock().expect(ERR_POISONED_LOCK).len(),
            )
            .field(
                "watchdog",
                &self.watchdog.lock().expect(ERR_POISONED_LOCK).len(),
            )
            .field("idle", &self.idle.lock().expect(ERR_POISONED_LOCK).len())
            .finish()
    }
}
