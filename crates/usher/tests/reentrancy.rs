// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reentrant `send`: submit-and-wait from the worker thread opens a nested
//! frame instead of deadlocking.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use usher::{Dispatcher, DispatcherHost, ShutdownMode, SubmitOptions};
use usher_testing::TEST_TIMEOUT;

#[test]
fn send_from_worker_runs_the_inner_operation_before_returning() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));

    let outer = dispatcher
        .post_with(SubmitOptions::new().with_priority(5), {
            let order = Arc::clone(&order);
            let dispatcher = dispatcher.clone();
            move || {
                order.lock().unwrap().push("outer-before");

                let value = dispatcher
                    .send_with(SubmitOptions::new().with_priority(7), None, {
                        let order = Arc::clone(&order);
                        move || {
                            order.lock().unwrap().push("inner");
                            42
                        }
                    })
                    .unwrap();

                order.lock().unwrap().push("outer-after");
                value
            }
        })
        .unwrap();

    assert_eq!(outer.join(Some(TEST_TIMEOUT)).unwrap(), 42);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["outer-before", "inner", "outer-after"]
    );

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn nested_frame_services_higher_priority_work_first() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));

    let outer = dispatcher
        .post_with(SubmitOptions::new().with_priority(5), {
            let order = Arc::clone(&order);
            let dispatcher = dispatcher.clone();
            move || {
                // Queued before the nested send, at a higher priority than
                // the inner operation: the nested frame must run it first.
                _ = dispatcher
                    .post_with(SubmitOptions::new().with_priority(9), {
                        let order = Arc::clone(&order);
                        move || order.lock().unwrap().push("high")
                    })
                    .unwrap();

                dispatcher
                    .send_with(SubmitOptions::new().with_priority(7), None, {
                        let order = Arc::clone(&order);
                        move || order.lock().unwrap().push("inner")
                    })
                    .unwrap();
            }
        })
        .unwrap();

    assert!(outer.wait(Some(TEST_TIMEOUT)).unwrap());
    assert_eq!(*order.lock().unwrap(), vec!["high", "inner"]);

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn current_priority_tracks_the_innermost_frame() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let observed = dispatcher
        .post_with(SubmitOptions::new().with_priority(5), {
            let dispatcher = dispatcher.clone();
            move || {
                let outer_before = dispatcher.current_priority();

                let inner = dispatcher
                    .send_with(SubmitOptions::new().with_priority(7), None, {
                        let dispatcher = dispatcher.clone();
                        move || dispatcher.current_priority()
                    })
                    .unwrap();

                let outer_after = dispatcher.current_priority();
                (outer_before, inner, outer_after)
            }
        })
        .unwrap();

    assert_eq!(
        observed.join(Some(TEST_TIMEOUT)).unwrap(),
        (Some(5), Some(7), Some(5))
    );

    // Off the worker thread there is no current operation.
    assert_eq!(dispatcher.current_priority(), None);
    assert_eq!(dispatcher.current_options(), None);

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn is_in_thread_is_true_only_inside_bodies() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    assert!(!dispatcher.is_in_thread());

    let inside = dispatcher
        .send({
            let dispatcher = dispatcher.clone();
            move || dispatcher.is_in_thread()
        })
        .unwrap();
    assert!(inside);

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn send_with_timeout_on_the_worker_abandons_the_wait_only() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let outcome = dispatcher
        .post({
            let dispatcher = dispatcher.clone();
            move || {
                // A higher-priority operation keeps the nested frame busy
                // past the send deadline.
                _ = dispatcher
                    .post_with(SubmitOptions::new().with_priority(9), || {
                        std::thread::sleep(Duration::from_millis(300));
                    })
                    .unwrap();

                dispatcher.send_with(
                    SubmitOptions::new().with_priority(1),
                    Some(Duration::from_millis(50)),
                    || 1,
                )
            }
        })
        .unwrap();

    let result = outcome.join(Some(TEST_TIMEOUT)).unwrap();
    assert!(matches!(result, Err(usher::Error::Timeout(_))));

    // The timed-out operation still runs to completion eventually.
    dispatcher.do_processing(0).unwrap();

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}
