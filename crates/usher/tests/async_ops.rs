// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Asynchronous bodies: suspension frees the worker, continuations resume on
//! the worker at the original priority, and `send_async` composes from both
//! sides of the thread boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::channel::oneshot;
use usher::{Dispatcher, DispatcherHost, OperationState, ShutdownMode, SubmitOptions, ambient};
use usher_testing::{TEST_TIMEOUT, wait_until};

#[test]
fn suspended_operation_does_not_hold_the_worker() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let (release, released) = oneshot::channel::<i32>();

    let suspended = dispatcher
        .post_future(move || async move { released.await.unwrap_or(0) })
        .unwrap();

    wait_until("the asynchronous body suspends", || {
        suspended.state() == OperationState::Executing
    });

    // The worker is free while the operation is suspended.
    assert_eq!(dispatcher.send(|| 7).unwrap(), 7);
    assert_eq!(suspended.state(), OperationState::Executing);

    release.send(5).unwrap();

    assert_eq!(suspended.join(Some(TEST_TIMEOUT)).unwrap(), 5);
    assert_eq!(suspended.state(), OperationState::Finished);

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn resumed_operation_reenters_at_its_original_priority() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (release, released) = oneshot::channel::<()>();

    let low = dispatcher
        .post_future_with(SubmitOptions::new().with_priority(1), {
            let order = Arc::clone(&order);
            move || async move {
                _ = released.await;
                order.lock().unwrap().push("low-resumed");
            }
        })
        .unwrap();
    wait_until("the low-priority body suspends", || {
        low.state() == OperationState::Executing
    });

    // Occupy the worker, queue a high-priority operation, then release the
    // suspended one: it re-enters behind the higher priority.
    let blocker = dispatcher
        .post_with(SubmitOptions::new().with_priority(5), || {
            std::thread::sleep(std::time::Duration::from_millis(100));
        })
        .unwrap();
    wait_until("the blocker occupies the worker", || {
        blocker.state() == OperationState::Executing
    });

    let high = dispatcher
        .post_with(SubmitOptions::new().with_priority(5), {
            let order = Arc::clone(&order);
            move || order.lock().unwrap().push("high")
        })
        .unwrap();

    release.send(()).unwrap();

    assert!(low.wait(Some(TEST_TIMEOUT)).unwrap());
    assert!(high.wait(Some(TEST_TIMEOUT)).unwrap());
    assert_eq!(*order.lock().unwrap(), vec!["high", "low-resumed"]);

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn send_async_from_another_thread_yields_the_result() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let future = dispatcher.send_async(|| 42).unwrap();
    assert_eq!(futures::executor::block_on(future).unwrap(), 42);

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn send_async_awaited_on_the_worker_is_reentrant() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let outer = dispatcher
        .post_future({
            let dispatcher = dispatcher.clone();
            move || async move {
                let inner = dispatcher.send_async(|| 42).unwrap();
                inner.await.unwrap()
            }
        })
        .unwrap();

    assert_eq!(outer.join(Some(TEST_TIMEOUT)).unwrap(), 42);

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn panicking_async_body_is_reported() {
    let dispatcher = Dispatcher::builder()
        .with_catch_exceptions(true)
        .build()
        .unwrap();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let handle: usher::OperationHandle<()> = dispatcher
        .post_future(|| async { panic!("async boom") })
        .unwrap();

    assert!(handle.wait(Some(TEST_TIMEOUT)).unwrap());
    assert_eq!(handle.state(), OperationState::Panicked);
    assert_eq!(
        handle.operation().panic_message().as_deref(),
        Some("async boom")
    );

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn ambient_hook_on_the_worker_posts_continuations() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let continued = Arc::new(AtomicBool::new(false));

    let scheduled = dispatcher
        .send({
            let continued = Arc::clone(&continued);
            move || {
                let hook = ambient::synchronization_hook()
                    .expect("the worker carries a dispatcher-backed hook");

                hook.schedule(Box::new(move || continued.store(true, Ordering::SeqCst)));
            }
        })
        .is_ok();
    assert!(scheduled);

    dispatcher.do_processing(0).unwrap();
    assert!(continued.load(Ordering::SeqCst));

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}
