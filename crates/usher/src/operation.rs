// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, SystemTime};

use crate::completion::{CompletionEvent, CompletionFuture};
use crate::dispatcher::DispatcherCore;
use crate::execution_context::{CaptureOptions, ExecutionContext};
use crate::{ERR_POISONED_LOCK, Error, Result};

/// Type-erased value produced by an operation body.
pub(crate) type BodyValue = Box<dyn Any + Send>;

/// Type-erased future produced by an asynchronous operation body.
pub(crate) type BodyFuture = Pin<Box<dyn Future<Output = BodyValue> + Send>>;

/// The work bound to an operation, probed once at submission time.
///
/// A synchronous body runs to completion inside a single worker step. An
/// asynchronous body produces a future on its first step; while that future
/// is pending the worker is free to run other operations, and the operation
/// re-enters the queue at its original priority when the future is woken.
pub(crate) enum Body {
    Sync(Box<dyn FnOnce() -> BodyValue + Send>),
    Async(Box<dyn FnOnce() -> BodyFuture + Send>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Body::Sync"),
            Self::Async(_) => f.write_str("Body::Async"),
        }
    }
}

/// Lifecycle state of an [`Operation`].
///
/// Transitions form a DAG: `Waiting` moves to `Canceled` or `Executing`;
/// `Executing` moves to `Finished`, `Panicked`, `Aborted`, or stays
/// `Executing` across asynchronous suspensions. The four terminal states are
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Submitted and queued, not yet picked up by the worker.
    Waiting,
    /// Currently running on the worker, or suspended awaiting an
    /// asynchronous continuation.
    Executing,
    /// The body ran to completion and produced a result.
    Finished,
    /// Canceled before the body ever started.
    Canceled,
    /// Forcibly terminated while executing, during dispatcher teardown.
    Aborted,
    /// The body panicked.
    Panicked,
}

impl OperationState {
    /// Whether this state is terminal. Terminal states are absorbing.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Canceled | Self::Aborted | Self::Panicked
        )
    }
}

enum BodyState {
    /// Not yet started; holds the submitted body.
    Pending(Body),
    /// An asynchronous body is suspended; holds its future.
    Suspended(BodyFuture),
    /// The body (or its future) is currently out on the worker's stack.
    Running,
    /// Terminal - nothing left to run.
    Consumed,
}

impl fmt::Debug for BodyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending(_) => "Pending",
            Self::Suspended(_) => "Suspended",
            Self::Running => "Running",
            Self::Consumed => "Consumed",
        };

        f.write_str(name)
    }
}

struct OperationCore {
    state: OperationState,
    body: BodyState,
    result: Option<BodyValue>,
    panic_message: Option<String>,
    first_execution_at: Option<SystemTime>,
    last_execution_at: Option<SystemTime>,
    run_time_total: Duration,
    watchdog_time: Duration,
    watchdog_events: u64,
    /// The operation currently sits in the dispatcher queue. Guards against
    /// double-enqueue when a suspended operation is woken more than once.
    queued: bool,
    /// A wakeup arrived while the future was out being polled; re-enqueue as
    /// soon as the future is stored back.
    wake_pending: bool,
}

pub(crate) struct OperationInner {
    dispatcher: Weak<DispatcherCore>,
    priority: u32,
    options: CaptureOptions,
    context: ExecutionContext,
    dispatched_at: SystemTime,
    core: Mutex<OperationCore>,
    done: Arc<CompletionEvent>,
}

/// A unit of work submitted to a [`Dispatcher`][crate::Dispatcher].
///
/// The handle is cheaply cloneable and shared between the submitter, the
/// dispatcher and any number of waiters. State, timing and watchdog counters
/// are observable from any thread; the body itself only ever runs on the
/// worker thread.
///
/// For access to the typed result of a submission, see
/// [`OperationHandle`].
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

enum TakenBody {
    Fresh(Body),
    Resumed(BodyFuture),
}

impl Operation {
    pub(crate) fn new(
        dispatcher: Weak<DispatcherCore>,
        priority: u32,
        options: CaptureOptions,
        context: ExecutionContext,
        body: Body,
    ) -> Self {
        Self {
            inner: Arc::new(OperationInner {
                dispatcher,
                priority,
                options,
                context,
                dispatched_at: SystemTime::now(),
                core: Mutex::new(OperationCore {
                    state: OperationState::Waiting,
                    body: BodyState::Pending(body),
                    result: None,
                    panic_message: None,
                    first_execution_at: None,
                    last_execution_at: None,
                    run_time_total: Duration::ZERO,
                    watchdog_time: Duration::ZERO,
                    watchdog_events: 0,
                    queued: false,
                    wake_pending: false,
                }),
                done: Arc::new(CompletionEvent::new()),
            }),
        }
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OperationState {
        self.inner.core.lock().expect(ERR_POISONED_LOCK).state
    }

    /// The priority this operation was bound to at submission time.
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.inner.priority
    }

    /// The capture options this operation was bound to at submission time.
    #[must_use]
    pub fn capture_options(&self) -> CaptureOptions {
        self.inner.options
    }

    /// Wall-clock time of submission.
    #[must_use]
    pub fn dispatched_at(&self) -> SystemTime {
        self.inner.dispatched_at
    }

    /// Wall-clock time of the first entry into the body, if any. Never
    /// changes once set.
    #[must_use]
    pub fn first_execution_at(&self) -> Option<SystemTime> {
        self.inner.core.lock().expect(ERR_POISONED_LOCK).first_execution_at
    }

    /// Wall-clock time of the most recent entry into the body, if any.
    #[must_use]
    pub fn last_execution_at(&self) -> Option<SystemTime> {
        self.inner.core.lock().expect(ERR_POISONED_LOCK).last_execution_at
    }

    /// Accumulated time the worker spent inside the body, as sampled by the
    /// watchdog. Zero before the first execution and when the watchdog is
    /// disabled; non-decreasing over the operation's lifetime.
    #[must_use]
    pub fn run_time_total(&self) -> Duration {
        self.inner.core.lock().expect(ERR_POISONED_LOCK).run_time_total
    }

    /// Time accumulated in the body since the last watchdog event.
    #[must_use]
    pub fn watchdog_time(&self) -> Duration {
        self.inner.core.lock().expect(ERR_POISONED_LOCK).watchdog_time
    }

    /// How often the watchdog fired for this operation.
    #[must_use]
    pub fn watchdog_events(&self) -> u64 {
        self.inner.core.lock().expect(ERR_POISONED_LOCK).watchdog_events
    }

    /// The panic payload message, once the state is
    /// [`Panicked`][OperationState::Panicked].
    #[must_use]
    pub fn panic_message(&self) -> Option<String> {
        self.inner
            .core
            .lock()
            .expect(ERR_POISONED_LOCK)
            .panic_message
            .clone()
    }

    /// Cancels the operation if it has not started executing.
    ///
    /// Succeeds only in the [`Waiting`][OperationState::Waiting] state, in
    /// which case waiters are released and the dispatcher drops its
    /// keep-alive reference. Returns whether the transition happened; an
    /// operation past `Waiting` is unaffected.
    pub fn cancel(&self) -> bool {
        let transitioned = {
            let mut core = self.inner.core.lock().expect(ERR_POISONED_LOCK);

            if core.state == OperationState::Waiting {
                core.state = OperationState::Canceled;
                core.body = BodyState::Consumed;
                true
            } else {
                false
            }
        };

        if transitioned {
            self.inner.done.set();

            if let Some(dispatcher) = self.inner.dispatcher.upgrade() {
                dispatcher.operation_canceled(self);
            }
        }

        transitioned
    }

    /// Hard cancel used by shutdown: `Waiting` becomes `Canceled`,
    /// `Executing` (a suspended asynchronous body) becomes `Aborted` and its
    /// future is dropped. Keep-alive bookkeeping is the caller's concern.
    pub(crate) fn force_cancel(&self) {
        let transitioned = {
            let mut core = self.inner.core.lock().expect(ERR_POISONED_LOCK);

            match core.state {
                OperationState::Waiting => {
                    core.state = OperationState::Canceled;
                    core.body = BodyState::Consumed;
                    true
                }
                OperationState::Executing => {
                    core.state = OperationState::Aborted;
                    core.body = BodyState::Consumed;
                    true
                }
                _ => false,
            }
        };

        if transitioned {
            self.inner.done.set();
        }
    }

    /// Blocks the calling thread until the operation reaches a terminal
    /// state. Returns `false` when `timeout` elapsed first; the operation is
    /// unaffected either way.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] when called from the worker thread
    /// of this operation's dispatcher - a synchronous wait can never be
    /// serviced from within the single worker. Use [`wait_async`] or the
    /// reentrant [`send`][crate::Dispatcher::send] instead.
    ///
    /// [`wait_async`]: Self::wait_async
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        if let Some(dispatcher) = self.inner.dispatcher.upgrade()
            && dispatcher.is_worker_thread()
        {
            return Err(Error::invalid_state(
                "wait cannot block the worker thread; use wait_async or send instead",
            ));
        }

        Ok(self.inner.done.wait(timeout))
    }

    /// A future resolving once the operation reaches a terminal state. May
    /// be created and awaited from any thread, including the worker.
    ///
    /// Dropping the future abandons the wait; timeouts compose through the
    /// host executor's combinators. The operation is unaffected either way.
    #[must_use]
    pub fn wait_async(&self) -> CompletionFuture {
        CompletionFuture::new(Arc::clone(&self.inner.done))
    }

    pub(crate) fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn mark_queued(&self) {
        self.inner.core.lock().expect(ERR_POISONED_LOCK).queued = true;
    }

    pub(crate) fn mark_dequeued(&self) {
        self.inner.core.lock().expect(ERR_POISONED_LOCK).queued = false;
    }

    /// Adds a watchdog sample to the runtime counters. When the accumulated
    /// `watchdog_time` exceeds `timeout` it is reset and the event counter
    /// incremented; returns the new event count in that case.
    pub(crate) fn add_sampled_time(&self, delta: Duration, timeout: Duration) -> Option<u64> {
        let mut core = self.inner.core.lock().expect(ERR_POISONED_LOCK);

        core.run_time_total = core.run_time_total.saturating_add(delta);
        core.watchdog_time = core.watchdog_time.saturating_add(delta);

        if core.watchdog_time > timeout {
            core.watchdog_time = Duration::ZERO;
            core.watchdog_events = core.watchdog_events.saturating_add(1);
            Some(core.watchdog_events)
        } else {
            None
        }
    }

    /// Runs one worker step of this operation: the whole body for
    /// synchronous work, one poll for asynchronous work. Driven exclusively
    /// by the dispatcher's frame loop on the worker thread.
    pub(crate) fn execute(&self) {
        let taken = {
            let mut core = self.inner.core.lock().expect(ERR_POISONED_LOCK);
            let now = SystemTime::now();

            match core.state {
                OperationState::Waiting => {
                    let BodyState::Pending(body) = mem::replace(&mut core.body, BodyState::Running)
                    else {
                        unreachable!("a waiting operation always holds its un-started body")
                    };

                    core.state = OperationState::Executing;
                    core.first_execution_at = Some(now);
                    core.last_execution_at = Some(now);
                    TakenBody::Fresh(body)
                }
                OperationState::Executing => {
                    match mem::replace(&mut core.body, BodyState::Running) {
                        BodyState::Suspended(future) => {
                            core.last_execution_at = Some(now);
                            TakenBody::Resumed(future)
                        }
                        other => {
                            // Spurious re-entry; nothing to run.
                            core.body = other;
                            return;
                        }
                    }
                }
                // Terminal before the worker got to it (e.g. canceled while queued).
                _ => return,
            }
        };

        match taken {
            TakenBody::Fresh(Body::Sync(body)) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    self.inner.context.run(self.inner.options, body)
                }));

                match outcome {
                    Ok(value) => self.finish(value),
                    Err(payload) => self.fail(payload),
                }
            }
            TakenBody::Fresh(Body::Async(factory)) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    self.inner.context.run(self.inner.options, factory)
                }));

                match outcome {
                    Ok(future) => self.poll_body(future),
                    Err(payload) => self.fail(payload),
                }
            }
            TakenBody::Resumed(future) => self.poll_body(future),
        }
    }

    fn poll_body(&self, mut future: BodyFuture) {
        let waker = Waker::from(Arc::new(ResumeWaker {
            operation: Arc::downgrade(&self.inner),
        }));
        let mut cx = Context::from_waker(&waker);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.inner
                .context
                .run(self.inner.options, || future.as_mut().poll(&mut cx))
        }));

        match outcome {
            Ok(Poll::Ready(value)) => self.finish(value),
            Ok(Poll::Pending) => {
                let resume_now = {
                    let mut core = self.inner.core.lock().expect(ERR_POISONED_LOCK);

                    if core.state == OperationState::Executing {
                        core.body = BodyState::Suspended(future);

                        if mem::take(&mut core.wake_pending) && !core.queued {
                            core.queued = true;
                            true
                        } else {
                            false
                        }
                    } else {
                        false
                    }
                };

                if resume_now {
                    self.resume();
                }
            }
            Err(payload) => self.fail(payload),
        }
    }

    /// Re-enqueues this suspended operation at its original priority, or
    /// aborts it when the dispatcher is gone.
    fn resume(&self) {
        match self.inner.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.resubmit(self),
            None => self.force_cancel(),
        }
    }

    fn finish(&self, value: BodyValue) {
        {
            let mut core = self.inner.core.lock().expect(ERR_POISONED_LOCK);
            core.state = OperationState::Finished;
            core.result = Some(value);
            core.body = BodyState::Consumed;
        }

        self.inner.done.set();
    }

    fn fail(&self, payload: Box<dyn Any + Send>) {
        let message = panic_message(payload);

        {
            let mut core = self.inner.core.lock().expect(ERR_POISONED_LOCK);
            core.state = OperationState::Panicked;
            core.panic_message = Some(message);
            core.body = BodyState::Consumed;
        }

        self.inner.done.set();
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("state", &self.state())
            .field("priority", &self.inner.priority)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// Wakes a suspended operation by re-enqueuing it on its dispatcher.
///
/// Holds only weak references: a waker lingering inside some foreign reactor
/// must not keep the operation or the dispatcher alive.
struct ResumeWaker {
    operation: Weak<OperationInner>,
}

impl Wake for ResumeWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let Some(inner) = self.operation.upgrade() else {
            return;
        };

        let operation = Operation { inner };

        // Decide under the operation lock, act outside it: resubmission takes
        // the dispatcher lock, which is never acquired while an operation
        // lock is held.
        let ready = {
            let mut core = operation.inner.core.lock().expect(ERR_POISONED_LOCK);

            match core.body {
                BodyState::Suspended(_) if !core.queued => {
                    core.queued = true;
                    true
                }
                BodyState::Suspended(_) => false,
                _ => {
                    if core.state == OperationState::Executing {
                        core.wake_pending = true;
                    }

                    false
                }
            }
        };

        if ready {
            operation.resume();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}

/// Typed view over an [`Operation`], produced by the submission surfaces of
/// the dispatcher. Adds result extraction on top of the untyped handle.
#[derive(Debug, Clone)]
pub struct OperationHandle<R> {
    operation: Operation,
    _result: PhantomData<fn() -> R>,
}

impl<R> OperationHandle<R>
where
    R: Send + 'static,
{
    pub(crate) fn new(operation: Operation) -> Self {
        Self {
            operation,
            _result: PhantomData,
        }
    }

    /// The untyped operation behind this handle.
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Discards the typed view.
    #[must_use]
    pub fn into_operation(self) -> Operation {
        self.operation
    }

    /// See [`Operation::state`].
    #[must_use]
    pub fn state(&self) -> OperationState {
        self.operation.state()
    }

    /// See [`Operation::cancel`].
    pub fn cancel(&self) -> bool {
        self.operation.cancel()
    }

    /// See [`Operation::wait`].
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.operation.wait(timeout)
    }

    /// See [`Operation::wait_async`].
    #[must_use]
    pub fn wait_async(&self) -> CompletionFuture {
        self.operation.wait_async()
    }

    /// A clone of the produced value, once the state is
    /// [`Finished`][OperationState::Finished].
    #[must_use]
    pub fn result(&self) -> Option<R>
    where
        R: Clone,
    {
        let core = self.operation.inner.core.lock().expect(ERR_POISONED_LOCK);

        core.result
            .as_ref()
            .and_then(|value| value.downcast_ref::<R>())
            .cloned()
    }

    /// Waits for the operation to terminate and extracts its outcome.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when `timeout` elapsed first (the operation
    /// continues), [`Error::Canceled`] when it ended canceled or aborted,
    /// [`Error::BodyPanicked`] when the body panicked, and
    /// [`Error::InvalidState`] when called from the worker thread.
    pub fn join(&self, timeout: Option<Duration>) -> Result<R> {
        if !self.operation.wait(timeout)? {
            return Err(Error::Timeout(timeout.unwrap_or_default()));
        }

        self.take_outcome()
    }

    /// Extracts the outcome of a terminated operation, consuming the stored
    /// result value.
    pub(crate) fn take_outcome(&self) -> Result<R> {
        let mut core = self.operation.inner.core.lock().expect(ERR_POISONED_LOCK);

        match core.state {
            OperationState::Finished => {
                let value = core.result.take().ok_or_else(|| {
                    Error::invalid_state("operation result was already extracted")
                })?;

                value
                    .downcast::<R>()
                    .map(|value| *value)
                    .map_err(|_| Error::invalid_state("operation result type mismatch"))
            }
            OperationState::Panicked => Err(Error::BodyPanicked {
                message: core.panic_message.clone().unwrap_or_default(),
                operation: self.operation.clone(),
            }),
            OperationState::Canceled | OperationState::Aborted => Err(Error::Canceled),
            OperationState::Waiting | OperationState::Executing => Err(Error::invalid_state(
                "operation has not reached a terminal state",
            )),
        }
    }
}
