// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherCore};
use crate::execution_context::CaptureOptions;
use crate::{Error, Result};

/// Collects configuration and builds a [`Dispatcher`].
///
/// ```
/// use std::time::Duration;
///
/// use usher::{CaptureOptions, Dispatcher};
///
/// let dispatcher = Dispatcher::builder()
///     .with_catch_exceptions(true)
///     .with_default_priority(100)
///     .with_default_options(CaptureOptions::LOCALE)
///     .with_watchdog_timeout(Duration::from_millis(500))
///     .build()?;
/// # Ok::<(), usher::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    /// A builder holding the documented defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
        }
    }

    /// Whether the worker keeps running after an operation body panics.
    /// When disabled (the default), a panicking body terminates the
    /// dispatcher and [`run()`][Dispatcher::run] returns the wrapped error.
    #[must_use]
    pub const fn with_catch_exceptions(mut self, catch_exceptions: bool) -> Self {
        self.config.catch_exceptions = catch_exceptions;
        self
    }

    /// The priority submissions resolve to when they do not specify one.
    /// Defaults to the middle of the priority range.
    #[must_use]
    pub const fn with_default_priority(mut self, priority: u32) -> Self {
        self.config.default_priority = priority;
        self
    }

    /// The ambient dimensions submissions capture when they do not specify
    /// any. Defaults to capturing nothing.
    #[must_use]
    pub const fn with_default_options(mut self, options: CaptureOptions) -> Self {
        self.config.default_options = options;
        self
    }

    /// Enables the watchdog: an advisory event is raised whenever the
    /// currently executing operation accumulates more body time than
    /// `timeout` since the last event. Disabled by default.
    #[must_use]
    pub const fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.config.watchdog_timeout = Some(timeout);
        self
    }

    /// Builds the dispatcher. It is created not-running; call
    /// [`run()`][Dispatcher::run] on the intended worker thread or hand it
    /// to a [`DispatcherHost`][crate::DispatcherHost].
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] when a zero watchdog timeout
    /// was configured.
    pub fn build(self) -> Result<Dispatcher> {
        if let Some(timeout) = self.config.watchdog_timeout
            && timeout.is_zero()
        {
            return Err(Error::invalid_argument(
                "watchdog timeout must be strictly positive",
            ));
        }

        Ok(Dispatcher::from_core(DispatcherCore::new(self.config)))
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
