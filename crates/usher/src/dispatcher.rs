// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{Level, event};

use crate::ambient;
use crate::builder::DispatcherBuilder;
use crate::completion::{CompletionEvent, CompletionFuture};
use crate::events::{EventHandlers, ExceptionEvent, WatchdogEvent};
use crate::execution_context::{CaptureOptions, ExecutionContext};
use crate::operation::{Body, BodyFuture, BodyValue, Operation, OperationHandle, OperationState};
use crate::priority_queue::PriorityQueue;
use crate::sync_hook::DispatcherSyncHook;
use crate::timer::{DispatchTimer, TimerMode};
use crate::watchdog::Watchdog;
use crate::{ERR_POISONED_LOCK, Error, Result};

/// How a shutdown disposes of queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Cancel every waiting operation (including ones enqueued later, e.g.
    /// by timers); the operation executing at shutdown time finishes its
    /// body normally; then terminate.
    DiscardPending,
    /// Drain the queue fully before terminating. New submissions fail.
    FinishPending,
    /// Like [`FinishPending`][Self::FinishPending], but new submissions from
    /// already-running code (bodies, idle handlers) keep being accepted;
    /// terminate once the queue empties with nothing running.
    AllowNew,
}

/// Per-submission overrides. Fields left at `None` resolve against the
/// dispatcher defaults at submission time.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    priority: Option<u32>,
    capture: Option<CaptureOptions>,
    context: Option<ExecutionContext>,
}

impl SubmitOptions {
    /// Options that resolve everything against the dispatcher defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the operation to `priority` instead of the dispatcher default.
    /// Higher runs earlier.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Captures the given ambient dimensions instead of the dispatcher
    /// default set.
    #[must_use]
    pub fn with_capture(mut self, options: CaptureOptions) -> Self {
        self.capture = Some(options);
        self
    }

    /// Uses a previously captured context instead of capturing one at
    /// submission time. Capture once, clone per submission.
    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// An entity the dispatcher keeps strongly referenced while it may still
/// affect the dispatcher: live operations and running timers.
#[derive(Debug, Clone)]
pub enum KeepAlive {
    /// An operation that is waiting or executing.
    Operation(Operation),
    /// A timer that is armed.
    Timer(DispatchTimer),
}

fn keep_alive_matches(a: &KeepAlive, b: &KeepAlive) -> bool {
    match (a, b) {
        (KeepAlive::Operation(x), KeepAlive::Operation(y)) => x.is_same(y),
        (KeepAlive::Timer(x), KeepAlive::Timer(y)) => x.is_same(y),
        _ => false,
    }
}

/// Resolved configuration of a dispatcher. See [`DispatcherBuilder`] for the
/// knobs and their defaults.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DispatcherConfig {
    pub catch_exceptions: bool,
    pub default_priority: u32,
    pub default_options: CaptureOptions,
    pub watchdog_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            catch_exceptions: false,
            default_priority: u32::MAX / 2,
            default_options: CaptureOptions::empty(),
            watchdog_timeout: None,
        }
    }
}

/// Everything a timer needs to build a fresh operation on every fire:
/// resolved priority and options, the captured context, and a body factory.
pub(crate) struct OperationTemplate {
    pub priority: u32,
    pub options: CaptureOptions,
    pub context: ExecutionContext,
    pub factory: Box<dyn Fn() -> Body + Send + Sync>,
}

#[derive(Debug)]
struct StackEntry {
    operation: Operation,
    priority: u32,
    options: CaptureOptions,
}

#[derive(Debug)]
struct DispatcherState {
    /// The worker thread, `None` iff not running.
    worker: Option<ThreadId>,
    queue: PriorityQueue<Operation>,
    /// Submissions arriving before `run()`; drained into `queue` when the
    /// worker binds.
    pre_run_queue: PriorityQueue<Operation>,
    shutdown_mode: Option<ShutdownMode>,
    /// The posted-signal: set by submissions and shutdown requests, consumed
    /// by the frame loop.
    posted_signal: bool,
    keep_alives: Vec<KeepAlive>,
    /// Execution stack of the worker; nested frames push their operation on
    /// top of the outer one.
    stack: Vec<StackEntry>,
    /// Latched when the worker terminates; replaced on every `run()`.
    finished: Arc<CompletionEvent>,
}

#[derive(Debug)]
pub(crate) struct DispatcherCore {
    weak_self: Weak<DispatcherCore>,
    config: DispatcherConfig,
    state: Mutex<DispatcherState>,
    posted: Condvar,
    events: Arc<EventHandlers>,
    watchdog: Watchdog,
}

/// Why a frame returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameExit {
    /// The frame's exit condition was met: trigger terminal, queue drained
    /// under a shutdown mode, or pending work discarded.
    Completed,
    /// The frame's deadline expired before its trigger terminated.
    TimedOut,
}

/// What the frame loop decided to do next, under the dispatcher lock.
enum FrameAction {
    /// DiscardPending: these were drained from the queue and must be
    /// canceled, then the frame exits.
    Discard(Vec<Operation>),
    /// FinishPending/AllowNew with an empty queue: exit the frame.
    ExitDrained,
    /// The frame's trigger is already terminal: exit the frame.
    ExitTrigger { queue_empty: bool },
    /// Execute this operation (it has been pushed onto the stack).
    Execute(Operation),
    /// Queue empty: signal idle and wait for the posted-signal.
    Sleep,
}

/// A single-threaded cooperative executor that owns one worker thread and
/// drains submitted operations in strict priority order.
///
/// # Threading model
///
/// Any thread may submit, cancel, query and subscribe. Exactly one thread -
/// whichever calls [`run()`][Self::run] - executes operation bodies.
/// Synchronous submit-and-wait from the worker thread itself does not block:
/// it opens a nested frame that keeps servicing the queue until the inner
/// operation terminates, which makes cascading `send` calls reentrant.
///
/// # Lifecycle
///
/// A dispatcher is created not-running; submissions made before `run()`
/// accumulate and are serviced once the worker binds. `run()` services
/// frames until a shutdown mode terminates it, tears down (hard-canceling
/// whatever is left) and returns. After teardown the dispatcher may be run
/// again.
///
/// The handle is cheap to clone; all clones refer to the same dispatcher.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
}

impl Dispatcher {
    /// A dispatcher with default configuration. Use [`builder()`] to
    /// configure one.
    ///
    /// [`builder()`]: Self::builder
    #[must_use]
    pub fn new() -> Self {
        Self::from_core(DispatcherCore::new(DispatcherConfig::default()))
    }

    /// Starts configuring a dispatcher.
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub(crate) fn from_core(core: Arc<DispatcherCore>) -> Self {
        Self { core }
    }

    // ----- submission -----

    /// Submits `body` for execution with default priority and options,
    /// without waiting. See [`post_with`][Self::post_with].
    pub fn post<F, R>(&self, body: F) -> Result<OperationHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.post_with(SubmitOptions::new(), body)
    }

    /// Submits `body` for execution, without waiting.
    ///
    /// The operation is enqueued at its resolved priority and a
    /// posted-signal wakes the worker. When the dispatcher is not running
    /// the submission is parked until [`run()`][Self::run].
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] when the dispatcher is shutting
    /// down in a mode that refuses new work. The operation is not created in
    /// that case.
    pub fn post_with<F, R>(&self, submit: SubmitOptions, body: F) -> Result<OperationHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let body = Body::Sync(Box::new(move || Box::new(body()) as BodyValue));
        Ok(OperationHandle::new(self.core.submit(submit, body)?))
    }

    /// Submits an asynchronous body with default priority and options. See
    /// [`post_future_with`][Self::post_future_with].
    pub fn post_future<F, Fut, R>(&self, factory: F) -> Result<OperationHandle<R>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        self.post_future_with(SubmitOptions::new(), factory)
    }

    /// Submits an asynchronous body, without waiting.
    ///
    /// The factory runs on the worker and produces the future; while the
    /// future is pending the worker services other operations, and the
    /// operation re-enters the queue at its original priority when woken.
    /// Continuations therefore resume on the worker thread.
    ///
    /// # Errors
    ///
    /// As [`post_with`][Self::post_with].
    pub fn post_future_with<F, Fut, R>(
        &self,
        submit: SubmitOptions,
        factory: F,
    ) -> Result<OperationHandle<R>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let body = Body::Async(Box::new(move || {
            let future = factory();
            let future: BodyFuture = Box::pin(async move { Box::new(future.await) as BodyValue });
            future
        }));

        Ok(OperationHandle::new(self.core.submit(submit, body)?))
    }

    /// Submits `body` and waits for its result. See
    /// [`send_with`][Self::send_with].
    pub fn send<F, R>(&self, body: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.send_with(SubmitOptions::new(), None, body)
    }

    /// Submits `body` and waits for its result.
    ///
    /// On the worker thread this opens a nested frame that keeps servicing
    /// the queue until the submitted operation terminates - cascading sends
    /// are reentrant and do not deadlock. On any other thread the caller
    /// blocks on the operation's completion.
    ///
    /// # Errors
    ///
    /// Submission errors as [`post_with`][Self::post_with];
    /// [`Error::Timeout`] when `timeout` expired first (the operation
    /// continues); [`Error::Canceled`] when the operation ended canceled or
    /// aborted; [`Error::BodyPanicked`] when its body panicked.
    pub fn send_with<F, R>(
        &self,
        submit: SubmitOptions,
        timeout: Option<Duration>,
        body: F,
    ) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let handle = self.post_with(submit, body)?;
        self.complete_send(&handle, timeout)
    }

    /// Submits `body` and returns a future producing its result. Reentrancy
    /// safe: may be called and awaited from the worker thread.
    ///
    /// # Errors
    ///
    /// Submission errors surface immediately; outcome errors (cancellation,
    /// panic) surface through the returned future as in
    /// [`send_with`][Self::send_with].
    pub fn send_async<F, R>(
        &self,
        body: F,
    ) -> Result<impl Future<Output = Result<R>> + Send + 'static>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.send_async_with(SubmitOptions::new(), body)
    }

    /// See [`send_async`][Self::send_async].
    pub fn send_async_with<F, R>(
        &self,
        submit: SubmitOptions,
        body: F,
    ) -> Result<impl Future<Output = Result<R>> + Send + 'static>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let handle = self.post_with(submit, body)?;

        Ok(async move {
            handle.wait_async().await;
            handle.take_outcome()
        })
    }

    fn complete_send<R>(&self, handle: &OperationHandle<R>, timeout: Option<Duration>) -> Result<R>
    where
        R: Send + 'static,
    {
        if self.is_in_thread() {
            let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

            match self.core.run_frame(Some(handle.operation()), deadline)? {
                FrameExit::Completed => {
                    if handle.state().is_terminal() {
                        handle.take_outcome()
                    } else {
                        // The frame was emptied out from under the trigger by
                        // a shutdown; the operation is about to be aborted.
                        Err(Error::Canceled)
                    }
                }
                FrameExit::TimedOut => Err(Error::Timeout(timeout.unwrap_or_default())),
            }
        } else {
            handle.join(timeout)
        }
    }

    // ----- timers -----

    /// Creates a stopped timer that submits `body` with default priority and
    /// options. See [`post_delayed_with`][Self::post_delayed_with].
    pub fn post_delayed<F, R>(
        &self,
        mode: TimerMode,
        delay: Duration,
        body: F,
    ) -> Result<DispatchTimer>
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        self.post_delayed_with(SubmitOptions::new(), mode, delay, body)
    }

    /// Creates a stopped timer bound to `body`: once
    /// [started][DispatchTimer::start], it submits a fresh operation after
    /// (one-shot) or every (periodic) `delay`.
    ///
    /// Priority, options and context are resolved once, now; every fire
    /// reuses them.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] for a zero `delay` and with
    /// [`Error::InvalidState`] when the dispatcher is not running.
    pub fn post_delayed_with<F, R>(
        &self,
        submit: SubmitOptions,
        mode: TimerMode,
        delay: Duration,
        body: F,
    ) -> Result<DispatchTimer>
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let body = Arc::new(body);
        let factory: Box<dyn Fn() -> Body + Send + Sync> = Box::new(move || {
            let body = Arc::clone(&body);
            Body::Sync(Box::new(move || Box::new(body()) as BodyValue))
        });

        self.core.create_timer(submit, mode, delay, factory)
    }

    /// As [`post_delayed_with`][Self::post_delayed_with], for asynchronous
    /// bodies.
    pub fn post_delayed_future_with<F, Fut, R>(
        &self,
        submit: SubmitOptions,
        mode: TimerMode,
        delay: Duration,
        factory: F,
    ) -> Result<DispatchTimer>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let factory = Arc::new(factory);
        let body_factory: Box<dyn Fn() -> Body + Send + Sync> = Box::new(move || {
            let factory = Arc::clone(&factory);
            Body::Async(Box::new(move || {
                let future = factory();
                let future: BodyFuture =
                    Box::pin(async move { Box::new(future.await) as BodyValue });
                future
            }))
        });

        self.core.create_timer(submit, mode, delay, body_factory)
    }

    // ----- queries -----

    /// Whether a worker thread is bound.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.state.lock().expect(ERR_POISONED_LOCK).worker.is_some()
    }

    /// Whether the dispatcher is running and a shutdown mode has been
    /// requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        let state = self.core.state.lock().expect(ERR_POISONED_LOCK);
        state.worker.is_some() && state.shutdown_mode.is_some()
    }

    /// Whether the calling thread is the worker thread. A dispatcher that is
    /// not running has no worker, so this is `false`.
    #[must_use]
    pub fn is_in_thread(&self) -> bool {
        self.core.is_worker_thread()
    }

    /// The priority of the innermost currently-executing operation, when
    /// called from the worker thread during execution.
    #[must_use]
    pub fn current_priority(&self) -> Option<u32> {
        let state = self.core.state.lock().expect(ERR_POISONED_LOCK);

        if state.worker == Some(thread::current().id()) {
            state.stack.last().map(|entry| entry.priority)
        } else {
            None
        }
    }

    /// The capture options of the innermost currently-executing operation,
    /// when called from the worker thread during execution.
    #[must_use]
    pub fn current_options(&self) -> Option<CaptureOptions> {
        let state = self.core.state.lock().expect(ERR_POISONED_LOCK);

        if state.worker == Some(thread::current().id()) {
            state.stack.last().map(|entry| entry.options)
        } else {
            None
        }
    }

    /// Whether the worker keeps running after an operation body panics.
    #[must_use]
    pub fn catch_exceptions(&self) -> bool {
        self.core.config.catch_exceptions
    }

    /// The priority submissions resolve to when they do not specify one.
    #[must_use]
    pub fn default_priority(&self) -> u32 {
        self.core.config.default_priority
    }

    /// The capture options submissions resolve to when they do not specify
    /// any.
    #[must_use]
    pub fn default_options(&self) -> CaptureOptions {
        self.core.config.default_options
    }

    /// The watchdog threshold, when enabled.
    #[must_use]
    pub fn watchdog_timeout(&self) -> Option<Duration> {
        self.core.config.watchdog_timeout
    }

    // ----- run and shutdown -----

    /// Binds the calling thread as the worker and services operations until
    /// a shutdown mode terminates the dispatcher.
    ///
    /// Replaces the ambient synchronization hook of the calling thread with
    /// a dispatcher-backed one for the duration (restored on exit) and
    /// drains submissions parked before the run.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] when already running, and with the
    /// wrapped body error when an operation panics while `catch_exceptions`
    /// is disabled (the dispatcher tears down first).
    pub fn run(&self) -> Result<()> {
        self.core.run(self)
    }

    /// Requests a shutdown without waiting for it. Wakes the worker. May be
    /// called from any thread, including the worker.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] when not running or already
    /// shutting down.
    pub fn begin_shutdown(&self, mode: ShutdownMode) -> Result<()> {
        _ = self.core.begin_shutdown(mode)?;
        Ok(())
    }

    /// Requests a shutdown and blocks until the worker terminated.
    ///
    /// # Errors
    ///
    /// As [`begin_shutdown`][Self::begin_shutdown], plus
    /// [`Error::InvalidState`] when called on the worker thread (it cannot
    /// wait for itself; use [`begin_shutdown`][Self::begin_shutdown] or
    /// [`shutdown_async`][Self::shutdown_async] there).
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        if self.is_in_thread() {
            return Err(Error::invalid_state(
                "shutdown cannot block the worker thread; use begin_shutdown or shutdown_async",
            ));
        }

        let finished = self.core.begin_shutdown(mode)?;
        _ = finished.wait(None);
        Ok(())
    }

    /// Requests a shutdown and returns a future resolving once the worker
    /// terminated. Safe on the worker thread.
    ///
    /// # Errors
    ///
    /// As [`begin_shutdown`][Self::begin_shutdown].
    pub fn shutdown_async(&self, mode: ShutdownMode) -> Result<CompletionFuture> {
        Ok(CompletionFuture::new(self.core.begin_shutdown(mode)?))
    }

    /// Blocks until a dispatcher that is already shutting down has
    /// terminated.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] when the dispatcher is not
    /// shutting down, or when called on the worker thread.
    pub fn wait_for_shutdown(&self) -> Result<()> {
        if self.is_in_thread() {
            return Err(Error::invalid_state(
                "wait_for_shutdown cannot block the worker thread",
            ));
        }

        let finished = self.core.finished_if_shutting_down()?;
        _ = finished.wait(None);
        Ok(())
    }

    /// A future resolving once a dispatcher that is already shutting down
    /// has terminated.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] when the dispatcher is not
    /// shutting down.
    pub fn wait_for_shutdown_async(&self) -> Result<CompletionFuture> {
        Ok(CompletionFuture::new(self.core.finished_if_shutting_down()?))
    }

    // ----- processing barriers -----

    /// Blocks until every operation queued at priority >= `min_priority` has
    /// been processed, including ones added at such priorities during the
    /// wait. On the worker thread this services nested frames instead of
    /// blocking.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] when the dispatcher is not running
    /// or stops accepting the internal barrier operations mid-wait.
    pub fn do_processing(&self, min_priority: u32) -> Result<()> {
        loop {
            if !self.core.has_pending_at_or_above(min_priority)? {
                return Ok(());
            }

            let sentinel = self.post_with(
                SubmitOptions::new()
                    .with_priority(min_priority)
                    .with_capture(CaptureOptions::empty()),
                || {},
            )?;

            if self.is_in_thread() {
                _ = self.core.run_frame(Some(sentinel.operation()), None)?;
            } else {
                _ = sentinel.wait(None)?;
            }
        }
    }

    /// The future-returning variant of [`do_processing`][Self::do_processing].
    /// May be awaited from the worker thread (inside an asynchronous body).
    pub fn do_processing_async(
        &self,
        min_priority: u32,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let dispatcher = self.clone();

        async move {
            loop {
                if !dispatcher.core.has_pending_at_or_above(min_priority)? {
                    return Ok(());
                }

                let sentinel = dispatcher.post_with(
                    SubmitOptions::new()
                        .with_priority(min_priority)
                        .with_capture(CaptureOptions::empty()),
                    || {},
                )?;

                sentinel.wait_async().await;
            }
        }
    }

    // ----- keep-alive -----

    /// Adds a strong reference the dispatcher holds until removed or torn
    /// down. Returns whether the dispatcher is running and the reference was
    /// added.
    pub fn add_keep_alive(&self, item: KeepAlive) -> bool {
        self.core.add_keep_alive(item)
    }

    /// Removes a previously added strong reference. Returns whether the
    /// dispatcher is running and the reference was present.
    pub fn remove_keep_alive(&self, item: &KeepAlive) -> bool {
        self.core.remove_keep_alive(item)
    }

    // ----- events -----

    /// Subscribes to body panics. Raised on the worker thread for every
    /// panicking operation, regardless of the `catch_exceptions` setting.
    pub fn on_exception(&self, handler: impl Fn(&ExceptionEvent) + Send + Sync + 'static) {
        self.core.events.subscribe_exception(handler);
    }

    /// Subscribes to watchdog firings. Raised on the watchdog thread.
    pub fn on_watchdog(&self, handler: impl Fn(&WatchdogEvent) + Send + Sync + 'static) {
        self.core.events.subscribe_watchdog(handler);
    }

    /// Subscribes to idle notifications: raised on the worker thread
    /// whenever the queue is found drained and when a shutdown completes.
    pub fn on_idle(&self, handler: impl Fn(&Dispatcher) + Send + Sync + 'static) {
        self.core.events.subscribe_idle(handler);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherCore {
    pub(crate) fn new(config: DispatcherConfig) -> Arc<Self> {
        let events = Arc::new(EventHandlers::default());

        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            watchdog: Watchdog::new(config.watchdog_timeout, Arc::clone(&events)),
            events,
            config,
            state: Mutex::new(DispatcherState {
                worker: None,
                queue: PriorityQueue::new(),
                pre_run_queue: PriorityQueue::new(),
                shutdown_mode: None,
                posted_signal: false,
                keep_alives: Vec::new(),
                stack: Vec::new(),
                finished: Arc::new(CompletionEvent::new()),
            }),
            posted: Condvar::new(),
        })
    }

    fn handle(&self) -> Dispatcher {
        Dispatcher::from_core(
            self.weak_self
                .upgrade()
                .expect("the core outlives every call into it"),
        )
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        self.state.lock().expect(ERR_POISONED_LOCK).worker == Some(thread::current().id())
    }

    fn resolve_submission(&self, submit: SubmitOptions) -> (u32, CaptureOptions, ExecutionContext) {
        let priority = submit.priority.unwrap_or(self.config.default_priority);
        let options = submit.capture.unwrap_or(self.config.default_options);
        let context = submit
            .context
            .unwrap_or_else(|| ExecutionContext::capture(options));

        (priority, options, context)
    }

    /// Creates and enqueues an operation. The single entry point for all
    /// submission surfaces.
    pub(crate) fn submit(&self, submit: SubmitOptions, body: Body) -> Result<Operation> {
        let (priority, options, context) = self.resolve_submission(submit);
        let operation = Operation::new(self.weak_self.clone(), priority, options, context, body);

        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.worker.is_none() {
            operation.mark_queued();
            state.pre_run_queue.enqueue(operation.clone(), priority);
            state.keep_alives.push(KeepAlive::Operation(operation.clone()));
        } else {
            if let Some(mode) = state.shutdown_mode
                && mode != ShutdownMode::AllowNew
            {
                return Err(Error::invalid_state(
                    "dispatcher is shutting down and does not accept new operations",
                ));
            }

            operation.mark_queued();
            state.queue.enqueue(operation.clone(), priority);
            state.keep_alives.push(KeepAlive::Operation(operation.clone()));
            state.posted_signal = true;
            self.posted.notify_all();
        }

        Ok(operation)
    }

    /// Builds and enqueues an operation from a timer template, when the
    /// dispatcher currently accepts work. Used by timer fires.
    pub(crate) fn submit_from_template(&self, template: &OperationTemplate) -> Option<Operation> {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.worker.is_none() {
            return None;
        }

        if let Some(mode) = state.shutdown_mode
            && mode != ShutdownMode::AllowNew
        {
            return None;
        }

        let operation = Operation::new(
            self.weak_self.clone(),
            template.priority,
            template.options,
            template.context.clone(),
            (template.factory)(),
        );

        operation.mark_queued();
        state.queue.enqueue(operation.clone(), template.priority);
        state.keep_alives.push(KeepAlive::Operation(operation.clone()));
        state.posted_signal = true;
        self.posted.notify_all();

        Some(operation)
    }

    /// Re-enqueues a suspended operation at its original priority after its
    /// continuation was woken. When the dispatcher is gone the operation is
    /// aborted instead.
    pub(crate) fn resubmit(&self, operation: &Operation) {
        let torn_down = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

            if state.worker.is_none() {
                true
            } else {
                state.queue.enqueue(operation.clone(), operation.priority());
                state.posted_signal = true;
                self.posted.notify_all();
                false
            }
        };

        if torn_down {
            operation.force_cancel();
        }
    }

    /// Called after a soft cancel: releases the keep-alive and wakes the
    /// worker so frames waiting on the canceled operation re-check.
    pub(crate) fn operation_canceled(&self, operation: &Operation) {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        state
            .keep_alives
            .retain(|item| !matches!(item, KeepAlive::Operation(other) if other.is_same(operation)));

        if state.worker.is_some() {
            state.posted_signal = true;
            self.posted.notify_all();
        }
    }

    pub(crate) fn current_submit_options(&self) -> SubmitOptions {
        let state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.worker == Some(thread::current().id())
            && let Some(top) = state.stack.last()
        {
            SubmitOptions::new()
                .with_priority(top.priority)
                .with_capture(top.options)
        } else {
            SubmitOptions::new()
        }
    }

    pub(crate) fn create_timer(
        &self,
        submit: SubmitOptions,
        mode: TimerMode,
        delay: Duration,
        factory: Box<dyn Fn() -> Body + Send + Sync>,
    ) -> Result<DispatchTimer> {
        if delay.is_zero() {
            return Err(Error::invalid_argument(
                "timer interval must be strictly positive",
            ));
        }

        if self.state.lock().expect(ERR_POISONED_LOCK).worker.is_none() {
            return Err(Error::invalid_state(
                "dispatcher must be running to create timers",
            ));
        }

        let (priority, options, context) = self.resolve_submission(submit);

        Ok(DispatchTimer::new(
            self.weak_self.clone(),
            mode,
            delay,
            OperationTemplate {
                priority,
                options,
                context,
                factory,
            },
        ))
    }

    pub(crate) fn add_keep_alive(&self, item: KeepAlive) -> bool {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.worker.is_none() {
            return false;
        }

        state.keep_alives.push(item);
        true
    }

    pub(crate) fn remove_keep_alive(&self, item: &KeepAlive) -> bool {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.worker.is_none() {
            return false;
        }

        let before = state.keep_alives.len();
        state
            .keep_alives
            .retain(|known| !keep_alive_matches(known, item));

        state.keep_alives.len() != before
    }

    fn has_pending_at_or_above(&self, min_priority: u32) -> Result<bool> {
        let state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.worker.is_none() {
            return Err(Error::invalid_state("dispatcher is not running"));
        }

        Ok(state
            .queue
            .peek_highest_priority()
            .is_some_and(|priority| priority >= min_priority))
    }

    pub(crate) fn begin_shutdown(&self, mode: ShutdownMode) -> Result<Arc<CompletionEvent>> {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.worker.is_none() {
            return Err(Error::invalid_state("dispatcher is not running"));
        }

        if state.shutdown_mode.is_some() {
            return Err(Error::invalid_state("dispatcher is already shutting down"));
        }

        state.shutdown_mode = Some(mode);
        state.posted_signal = true;
        self.posted.notify_all();

        event!(Level::DEBUG, ?mode, "dispatcher shutdown requested");

        Ok(Arc::clone(&state.finished))
    }

    fn finished_if_shutting_down(&self) -> Result<Arc<CompletionEvent>> {
        let state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.worker.is_some() && state.shutdown_mode.is_some() {
            Ok(Arc::clone(&state.finished))
        } else {
            Err(Error::invalid_state("dispatcher is not shutting down"))
        }
    }

    fn run(&self, dispatcher: &Dispatcher) -> Result<()> {
        {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

            if state.worker.is_some() {
                return Err(Error::invalid_state("dispatcher is already running"));
            }

            state.worker = Some(thread::current().id());
            state.shutdown_mode = None;
            state.finished = Arc::new(CompletionEvent::new());

            let mut pre_run = mem::replace(&mut state.pre_run_queue, PriorityQueue::new());
            pre_run.move_to(&mut state.queue);
            state.posted_signal = !state.queue.is_empty();
        }

        event!(Level::DEBUG, "dispatcher bound to worker thread");

        let previous_hook = ambient::set_synchronization_hook(Some(Arc::new(
            DispatcherSyncHook::new(self.weak_self.clone()),
        )));
        self.watchdog.start();

        let result = self.run_frame(None, None);

        // Teardown. Ordering matters: surveillance ends, leftovers are
        // hard-canceled, idle is raised, the ambient hook is restored, and
        // only then is termination signaled to waiters.
        self.watchdog.stop();

        let (leftovers, finished) = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

            let leftovers = mem::take(&mut state.keep_alives);
            state.queue = PriorityQueue::new();
            state.pre_run_queue = PriorityQueue::new();
            state.stack.clear();
            state.worker = None;
            state.shutdown_mode = None;
            state.posted_signal = false;

            (leftovers, Arc::clone(&state.finished))
        };

        // The keep-alive set holds every live operation (queued, suspended
        // or stacked) and every armed timer, so draining it covers the
        // stack and the queues as well.
        for item in leftovers {
            match item {
                KeepAlive::Operation(operation) => operation.force_cancel(),
                KeepAlive::Timer(timer) => {
                    _ = timer.stop();
                }
            }
        }

        self.events.raise_idle(dispatcher);
        ambient::set_synchronization_hook(previous_hook);
        finished.set();

        event!(Level::DEBUG, "dispatcher worker terminated");

        result.map(|_exit| ())
    }

    /// Services operations until the frame's exit condition is met.
    ///
    /// The top-level frame (no trigger) exits when a shutdown mode decides
    /// to; a nested frame exits once its trigger operation is terminal or
    /// its deadline expired.
    fn run_frame(&self, trigger: Option<&Operation>, deadline: Option<Instant>) -> Result<FrameExit> {
        let dispatcher = self.handle();

        loop {
            if !self.wait_for_posted(deadline) {
                return Ok(FrameExit::TimedOut);
            }

            loop {
                match self.next_action(trigger) {
                    FrameAction::Discard(operations) => {
                        for operation in &operations {
                            operation.force_cancel();
                        }

                        self.events.raise_idle(&dispatcher);
                        return Ok(FrameExit::Completed);
                    }
                    FrameAction::ExitDrained => {
                        self.events.raise_idle(&dispatcher);

                        // Idle handlers may enqueue follow-up work in
                        // AllowNew mode; drain it before terminating.
                        let more_work =
                            !self.state.lock().expect(ERR_POISONED_LOCK).queue.is_empty();
                        if more_work {
                            continue;
                        }

                        return Ok(FrameExit::Completed);
                    }
                    FrameAction::ExitTrigger { queue_empty } => {
                        if queue_empty {
                            self.events.raise_idle(&dispatcher);
                        }

                        return Ok(FrameExit::Completed);
                    }
                    FrameAction::Execute(operation) => {
                        self.watchdog.start_surveillance(&operation);
                        operation.execute();
                        self.watchdog.stop_surveillance(&operation);
                        self.finish_step(&operation);

                        if operation.state() == OperationState::Panicked {
                            let event = ExceptionEvent {
                                message: operation.panic_message().unwrap_or_default(),
                                operation: operation.clone(),
                                can_continue: self.config.catch_exceptions,
                            };

                            event!(
                                Level::ERROR,
                                message = %event.message,
                                "operation body panicked"
                            );
                            self.events.raise_exception(&event);

                            if !self.config.catch_exceptions {
                                return Err(Error::BodyPanicked {
                                    message: event.message,
                                    operation,
                                });
                            }
                        }

                        if let Some(trigger) = trigger
                            && trigger.is_same(&operation)
                            && operation.state().is_terminal()
                        {
                            let queue_empty =
                                self.state.lock().expect(ERR_POISONED_LOCK).queue.is_empty();
                            if queue_empty {
                                self.events.raise_idle(&dispatcher);
                            }

                            return Ok(FrameExit::Completed);
                        }

                        if let Some(deadline) = deadline
                            && Instant::now() >= deadline
                        {
                            return Ok(FrameExit::TimedOut);
                        }
                    }
                    FrameAction::Sleep => {
                        self.events.raise_idle(&dispatcher);
                        break;
                    }
                }
            }
        }
    }

    /// Blocks until the posted-signal is raised, consuming it. Returns
    /// `false` when `deadline` passed first.
    fn wait_for_posted(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        loop {
            if state.posted_signal {
                state.posted_signal = false;
                return true;
            }

            match deadline {
                None => state = self.posted.wait(state).expect(ERR_POISONED_LOCK),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }

                    let (guard, _) = self
                        .posted
                        .wait_timeout(state, deadline.duration_since(now))
                        .expect(ERR_POISONED_LOCK);
                    state = guard;
                }
            }
        }
    }

    fn next_action(&self, trigger: Option<&Operation>) -> FrameAction {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        // A trigger canceled from outside must release its frame even
        // though it will never be dequeued.
        if let Some(trigger) = trigger
            && trigger.state().is_terminal()
        {
            return FrameAction::ExitTrigger {
                queue_empty: state.queue.is_empty(),
            };
        }

        match state.shutdown_mode {
            Some(ShutdownMode::DiscardPending) => {
                let operations = state.queue.drain_all();

                for operation in &operations {
                    state.keep_alives.retain(
                        |item| !matches!(item, KeepAlive::Operation(other) if other.is_same(operation)),
                    );
                }

                return FrameAction::Discard(operations);
            }
            Some(ShutdownMode::FinishPending | ShutdownMode::AllowNew)
                if state.queue.is_empty() =>
            {
                return FrameAction::ExitDrained;
            }
            _ => {}
        }

        loop {
            let Some(operation) = state.queue.dequeue() else {
                return FrameAction::Sleep;
            };

            operation.mark_dequeued();

            // Canceled while queued: drop it here, it has no step to run.
            if operation.state().is_terminal() {
                state.keep_alives.retain(
                    |item| !matches!(item, KeepAlive::Operation(other) if other.is_same(&operation)),
                );
                continue;
            }

            state.stack.push(StackEntry {
                operation: operation.clone(),
                priority: operation.priority(),
                options: operation.capture_options(),
            });

            return FrameAction::Execute(operation);
        }
    }

    /// Pops the execution stack after a worker step and releases the
    /// keep-alive when the operation terminated.
    fn finish_step(&self, operation: &Operation) {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        let entry = state.stack.pop();
        debug_assert!(
            entry.is_some_and(|entry| entry.operation.is_same(operation)),
            "execution stack out of sync"
        );

        if operation.state().is_terminal() {
            state.keep_alives.retain(
                |item| !matches!(item, KeepAlive::Operation(other) if other.is_same(operation)),
            );
        }
    }
}
