// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Multiple dispatchers coexist in one process with fully isolated state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use usher::{Dispatcher, DispatcherHost, ShutdownMode};
use usher_testing::{TEST_TIMEOUT, wait_until};

#[test]
fn two_dispatchers_post_into_each_other() {
    let first = Dispatcher::new();
    let second = Dispatcher::new();
    let first_host = DispatcherHost::start(first.clone()).unwrap();
    let second_host = DispatcherHost::start(second.clone()).unwrap();

    let executed = Arc::new(AtomicUsize::new(0));

    // Bodies on each dispatcher post follow-ups into the other one.
    for _ in 0..10 {
        let executed_by_first = Arc::clone(&executed);
        let second_clone = second.clone();

        first
            .post(move || {
                _ = second_clone.post(move || {
                    _ = executed_by_first.fetch_add(1, Ordering::SeqCst);
                });
            })
            .unwrap();

        let executed_by_second = Arc::clone(&executed);
        let first_clone = first.clone();

        second
            .post(move || {
                _ = first_clone.post(move || {
                    _ = executed_by_second.fetch_add(1, Ordering::SeqCst);
                });
            })
            .unwrap();
    }

    wait_until("all cross-posted bodies execute", || {
        executed.load(Ordering::SeqCst) == 20
    });

    first_host.shutdown(ShutdownMode::FinishPending).unwrap();
    second_host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn a_worker_may_send_into_another_dispatcher() {
    let first = Dispatcher::new();
    let second = Dispatcher::new();
    let first_host = DispatcherHost::start(first.clone()).unwrap();
    let second_host = DispatcherHost::start(second.clone()).unwrap();

    // `send` into a foreign dispatcher blocks the calling worker like any
    // other external caller; the foreign worker services it.
    let value = first
        .send({
            let second = second.clone();
            move || second.send(|| 21 * 2).unwrap()
        })
        .unwrap();
    assert_eq!(value, 42);

    first_host.shutdown(ShutdownMode::FinishPending).unwrap();
    second_host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn worker_thread_checks_are_per_dispatcher() {
    let first = Dispatcher::new();
    let second = Dispatcher::new();
    let first_host = DispatcherHost::start(first.clone()).unwrap();
    let second_host = DispatcherHost::start(second.clone()).unwrap();

    let (on_first, on_second) = first
        .send({
            let first = first.clone();
            let second = second.clone();
            move || (first.is_in_thread(), second.is_in_thread())
        })
        .unwrap();

    assert!(on_first);
    assert!(!on_second);

    // Waiting on the first worker for an operation of the second is fine.
    let foreign = second.post(|| 5).unwrap();
    let observed = first
        .send(move || foreign.join(Some(TEST_TIMEOUT)).unwrap())
        .unwrap();
    assert_eq!(observed, 5);

    first_host.shutdown(ShutdownMode::FinishPending).unwrap();
    second_host.shutdown(ShutdownMode::FinishPending).unwrap();
}
