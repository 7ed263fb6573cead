// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::ERR_POISONED_LOCK;

/// A latched event: signaled at most once and observed by any number of
/// blocking and asynchronous waiters, before or after the signal.
///
/// This is the coordination primitive behind operation completion and
/// dispatcher termination. Waiters that show up after the signal complete
/// immediately; wakers registered before the signal are woken outside the
/// internal lock.
#[derive(Debug)]
pub(crate) struct CompletionEvent {
    state: Mutex<CompletionState>,
    signaled: Condvar,
}

#[derive(Debug)]
struct CompletionState {
    set: bool,
    wakers: Vec<Waker>,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState {
                set: false,
                wakers: Vec::new(),
            }),
            signaled: Condvar::new(),
        }
    }

    /// Signals the event. Signaling more than once is permitted and has no
    /// further effect.
    #[cfg_attr(test, mutants::skip)] // Critical primitive - causes test timeouts if tampered.
    pub fn set(&self) {
        let wakers = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

            if state.set {
                return;
            }

            state.set = true;
            std::mem::take(&mut state.wakers)
        };

        self.signaled.notify_all();

        // Wakeups happen outside the lock to avoid contention with waiters
        // that resume instantly.
        for waker in wakers {
            waker.wake();
        }
    }

    #[cfg(test)]
    pub fn is_set(&self) -> bool {
        self.state.lock().expect(ERR_POISONED_LOCK).set
    }

    /// Blocks the calling thread until the event is signaled. Returns `false`
    /// if `timeout` elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        match timeout.and_then(|timeout| Instant::now().checked_add(timeout)) {
            None => {
                while !state.set {
                    state = self.signaled.wait(state).expect(ERR_POISONED_LOCK);
                }

                true
            }
            Some(deadline) => {
                while !state.set {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }

                    let (guard, _) = self
                        .signaled
                        .wait_timeout(state, deadline.duration_since(now))
                        .expect(ERR_POISONED_LOCK);
                    state = guard;
                }

                true
            }
        }
    }

    /// Poll-style observation for [`CompletionFuture`]. Registers `waker`
    /// when the event is not yet signaled.
    fn poll(&self, waker: &Waker) -> bool {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        if state.set {
            return true;
        }

        if !state.wakers.iter().any(|known| known.will_wake(waker)) {
            state.wakers.push(waker.clone());
        }

        false
    }
}

/// Resolves once the event it observes has been signaled.
///
/// Returned by the asynchronous wait surfaces of the dispatcher
/// ([`Operation::wait_async`][crate::Operation::wait_async],
/// [`Dispatcher::shutdown_async`][crate::Dispatcher::shutdown_async] and
/// friends). Dropping the future abandons the wait; the observed event is
/// unaffected.
#[derive(Debug, Clone)]
pub struct CompletionFuture {
    event: Arc<CompletionEvent>,
}

impl CompletionFuture {
    pub(crate) fn new(event: Arc<CompletionEvent>) -> Self {
        Self { event }
    }
}

impl Future for CompletionFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.event.poll(cx.waker()) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use std::task;
    use std::thread;

    use futures::FutureExt;
    use futures::task::noop_waker_ref;

    use super::*;

    #[test]
    fn wait_after_set_completes_immediately() {
        let event = CompletionEvent::new();

        event.set();

        assert!(event.is_set());
        assert!(event.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn wait_times_out_when_never_set() {
        let event = CompletionEvent::new();

        assert!(!event.wait(Some(Duration::from_millis(10))));
        assert!(!event.is_set());
    }

    #[test]
    fn wait_is_released_by_another_thread() {
        let event = Arc::new(CompletionEvent::new());

        let signaler = thread::spawn({
            let event = Arc::clone(&event);
            move || event.set()
        });

        assert!(event.wait(None));
        signaler.join().unwrap();
    }

    #[test]
    fn set_twice_is_permitted() {
        let event = CompletionEvent::new();

        event.set();
        event.set();

        assert!(event.is_set());
    }

    #[test]
    fn future_pending_before_set_ready_after() {
        let event = Arc::new(CompletionEvent::new());
        let mut future = CompletionFuture::new(Arc::clone(&event));

        let cx = &mut task::Context::from_waker(noop_waker_ref());
        assert_eq!(future.poll_unpin(cx), Poll::Pending);

        event.set();

        assert_eq!(future.poll_unpin(cx), Poll::Ready(()));
    }

    #[test]
    fn repeated_polls_do_not_pile_up_wakers() {
        let event = Arc::new(CompletionEvent::new());
        let mut future = CompletionFuture::new(Arc::clone(&event));

        let cx = &mut task::Context::from_waker(noop_waker_ref());
        assert_eq!(future.poll_unpin(cx), Poll::Pending);
        assert_eq!(future.poll_unpin(cx), Poll::Pending);

        assert_eq!(event.state.lock().unwrap().wakers.len(), 1);
    }
}
