// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A thread-bound prioritized dispatcher.
//!
//! A [`Dispatcher`] owns exactly one worker thread and drains submitted
//! operations in strict priority order: the worker always services the
//! highest-priority operation currently queued, and operations sharing a
//! priority run in submission order. Any thread may submit work; only the
//! worker executes it.
//!
//! The main building blocks are:
//!
//! - [`Dispatcher`] - the run loop, submission surface and shutdown
//!   coordination. The worker thread is whichever thread calls
//!   [`Dispatcher::run()`]; [`DispatcherHost`] spawns and owns one for you.
//! - [`Operation`] / [`OperationHandle`] - a submitted unit of work with an
//!   observable lifecycle (wait, cancel, result, error, timing counters).
//! - [`DispatchTimer`] - a one-shot or periodic submitter that feeds
//!   operations into the dispatcher and accounts for missed fires.
//! - [`ExecutionContext`] - a snapshot of ambient state (locale, scope,
//!   synchronization hook) re-established around the operation body.
//! - a watchdog that observes the currently executing operation and raises
//!   an advisory event when it runs longer than a configured threshold.

// Public API surface.
mod builder;
mod dispatcher;
mod error;
mod execution_context;
mod host;
mod operation;
mod timer;

pub use builder::*;
pub use dispatcher::*;
pub use error::*;
pub use execution_context::*;
pub use host::*;
pub use operation::*;
pub use timer::*;

// Not re-exported because the module name is an important identifying factor.
pub mod ambient;

// Internal to the crate but re-exported at crate root for reduced hassle.
mod completion;
mod events;
mod priority_queue;
mod sync_hook;
mod watchdog;

pub use completion::CompletionFuture;
pub use events::{ExceptionEvent, WatchdogEvent};

pub(crate) use completion::CompletionEvent;
pub(crate) use events::EventHandlers;
pub(crate) use priority_queue::PriorityQueue;
pub(crate) use watchdog::Watchdog;

pub(crate) const ERR_POISONED_LOCK: &str =
    "poisoned lock - cannot continue execution because internal invariants can no longer be upheld";
