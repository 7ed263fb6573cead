// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared helpers for the `usher` test suite.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::level_filters::LevelFilter;

/// If something (whatever) does not happen in a test within this time, the
/// test will fail.
///
/// We are conservative here and allow much time - this is only to break out
/// of infinite loops, not for any situations that are actually expected.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes a thread-safe function on a background thread and abandons it if
/// it does not complete before [`TEST_TIMEOUT`].
///
/// Returns `None` when the function timed out or panicked.
#[must_use]
pub fn execute_or_abandon<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (sender, receiver) = mpsc::channel();

    // There are multiple ways for the called function to fail:
    // 1. It fails to finish in the allowed time span.
    // 2. It panics, so the result is never sent.
    //
    // In both cases the channel gets closed and recv_timeout signals an
    // error.
    _ = thread::spawn(move || {
        let result = f();
        _ = sender.send(result);
    });

    receiver.recv_timeout(TEST_TIMEOUT).ok()
}

/// Spins until `condition` holds, asserting it does so within
/// [`TEST_TIMEOUT`]. For bridging small scheduling gaps in tests, not for
/// synchronization.
///
/// # Panics
///
/// Panics when the condition did not hold within the timeout.
pub fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();

    while !condition() {
        assert!(
            started.elapsed() < TEST_TIMEOUT,
            "timed out waiting until: {description}"
        );

        thread::sleep(Duration::from_millis(1));
    }
}

/// Installs a fmt tracing subscriber for the current test run. Safe to call
/// from every test; only the first call per process wins.
pub fn init_test_logging() {
    _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}
