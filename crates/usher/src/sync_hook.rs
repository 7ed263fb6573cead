// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Weak;

use crate::ambient::SynchronizationHook;
use crate::dispatcher::DispatcherCore;
use crate::operation::{Body, BodyValue};

/// The ambient synchronization hook installed on the worker thread for the
/// duration of a run: continuations scheduled through it re-enter the worker
/// as posted operations, at the priority and options of the innermost
/// currently-executing operation (or the dispatcher defaults when scheduled
/// from elsewhere).
///
/// Holds the dispatcher weakly so a hook captured into a long-lived context
/// snapshot cannot keep a torn-down dispatcher alive. Continuations
/// scheduled after the dispatcher is gone, or while it refuses new work, are
/// dropped.
pub(crate) struct DispatcherSyncHook {
    core: Weak<DispatcherCore>,
}

impl DispatcherSyncHook {
    pub fn new(core: Weak<DispatcherCore>) -> Self {
        Self { core }
    }
}

impl SynchronizationHook for DispatcherSyncHook {
    fn schedule(&self, continuation: Box<dyn FnOnce() + Send>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };

        let submit = core.current_submit_options();
        _ = core.submit(
            submit,
            Body::Sync(Box::new(move || {
                continuation();
                Box::new(()) as BodyValue
            })),
        );
    }
}

impl fmt::Debug for DispatcherSyncHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherSyncHook").finish_non_exhaustive()
    }
}
