// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use thiserror::Error;

use crate::Operation;

/// A specialized `Result` type for dispatcher operations that return an
/// [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the dispatcher.
///
/// This is an umbrella type for all kinds of errors the dispatcher surfaces,
/// from caller mistakes (invalid arguments, calls in the wrong state) to
/// outcomes of the submitted work itself (expired waits, canceled operations,
/// panicked bodies). Future versions may add additional enum variants.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller supplied an argument outside the accepted range, such as a
    /// zero timer interval or a zero watchdog timeout.
    #[error("{0}")]
    InvalidArgument(String),

    /// The call is not permitted in the current dispatcher or operation
    /// state, such as posting into a dispatcher that is shutting down or
    /// waiting synchronously on the worker thread.
    #[error("{0}")]
    InvalidState(String),

    /// A wait expired before the awaited operation reached a terminal state.
    ///
    /// The operation itself is unaffected and continues; only the wait site
    /// gives up.
    #[error("wait of {0:?} expired before the operation reached a terminal state")]
    Timeout(Duration),

    /// The awaited operation terminated as canceled or aborted instead of
    /// producing a result.
    #[error("operation was canceled before producing a result")]
    Canceled,

    /// An operation body panicked. The panic payload message and the
    /// operation it happened in are attached.
    #[error("operation body panicked: {message}")]
    BodyPanicked {
        /// Message extracted from the panic payload.
        message: String,
        /// The operation whose body panicked.
        operation: Operation,
    },
}

impl Error {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
