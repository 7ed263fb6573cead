// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Timers: scheduled submission, the at-most-one-outstanding guarantee, and
//! miss accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use usher::{Dispatcher, DispatcherHost, Error, OperationState, ShutdownMode, TimerMode};
use usher_testing::wait_until;

#[test]
fn one_shot_timer_fires_once_and_stops() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let fired = Arc::new(AtomicI32::new(0));

    let timer = dispatcher
        .post_delayed(TimerMode::OneShot, Duration::from_millis(20), {
            let fired = Arc::clone(&fired);
            move || {
                _ = fired.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    assert!(!timer.is_running());
    timer.start(Duration::from_millis(20)).unwrap();
    assert!(timer.is_running());

    wait_until("the one-shot timer fires and disarms", || {
        !timer.is_running()
    });
    dispatcher.do_processing(0).unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(timer.execution_count(), 1);
    assert_eq!(timer.miss_count(), 0);

    let produced = timer.previous_operation().expect("one operation was submitted");
    assert_eq!(produced.state(), OperationState::Finished);

    // It already stopped by itself.
    assert!(!timer.stop());

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn periodic_timer_with_a_slow_body_counts_misses() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let live = Arc::new(AtomicI32::new(0));
    let max_live = Arc::new(AtomicI32::new(0));

    // A 100 ms periodic timer whose body runs for 250 ms: most fires find
    // the previous operation still live and count a miss instead.
    let timer = dispatcher
        .post_delayed(TimerMode::Periodic, Duration::from_millis(100), {
            let live = Arc::clone(&live);
            let max_live = Arc::clone(&max_live);
            move || {
                let now_live = live.fetch_add(1, Ordering::SeqCst) + 1;
                _ = max_live.fetch_max(now_live, Ordering::SeqCst);

                thread::sleep(Duration::from_millis(250));

                _ = live.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    timer.start(Duration::from_millis(100)).unwrap();
    thread::sleep(Duration::from_millis(1050));
    assert!(timer.stop());

    let executions = timer.execution_count();
    let misses = timer.miss_count();

    // Never more than one of the timer's operations live at any instant.
    assert_eq!(max_live.load(Ordering::SeqCst), 1);

    assert!(
        (9..=10).contains(&(executions + misses)),
        "expected 9-10 fires, got {executions} executions and {misses} misses"
    );
    assert!(
        (3..=5).contains(&executions),
        "expected ~4 executions, got {executions}"
    );
    assert!(
        (4..=6).contains(&misses),
        "expected ~5 misses, got {misses}"
    );

    dispatcher.do_processing(0).unwrap();
    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn restart_rearms_and_resets_the_counters() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let timer = dispatcher
        .post_delayed(TimerMode::Periodic, Duration::from_millis(20), || ())
        .unwrap();

    timer.start(Duration::from_millis(20)).unwrap();
    wait_until("the timer fires at least twice", || {
        timer.execution_count() >= 2
    });

    timer.restart(Duration::from_millis(30)).unwrap();
    assert!(timer.is_running());
    assert_eq!(timer.interval(), Duration::from_millis(30));

    wait_until("the restarted timer fires again", || {
        timer.execution_count() >= 1
    });

    assert!(timer.stop());
    dispatcher.do_processing(0).unwrap();

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn double_start_is_rejected() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let timer = dispatcher
        .post_delayed(TimerMode::Periodic, Duration::from_millis(50), || ())
        .unwrap();

    timer.start(Duration::from_millis(50)).unwrap();
    assert!(matches!(
        timer.start(Duration::from_millis(50)),
        Err(Error::InvalidState(_))
    ));

    assert!(timer.stop());
    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn timer_stops_itself_when_the_dispatcher_goes_away() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    let timer = dispatcher
        .post_delayed(TimerMode::Periodic, Duration::from_millis(20), || ())
        .unwrap();
    timer.start(Duration::from_millis(20)).unwrap();

    host.shutdown(ShutdownMode::DiscardPending).unwrap();

    wait_until("the timer notices the dispatcher terminated", || {
        !timer.is_running()
    });
}
