// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use scopeguard::defer;

use crate::ambient::{self, AmbientScope, Locale, SynchronizationHook};

bitflags! {
    /// Selects which ambient dimensions an [`ExecutionContext`] captures at
    /// submission time and re-establishes around the operation body.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CaptureOptions: u8 {
        /// Capture the caller's ambient scope.
        const SCOPE = 1 << 0;
        /// Capture the caller's synchronization hook.
        const SYNC_HOOK = 1 << 1;
        /// Capture the caller's locale.
        const LOCALE = 1 << 2;
        /// Capture the caller's display locale.
        const DISPLAY_LOCALE = 1 << 3;
    }
}

/// A snapshot of ambient thread state, taken on the submitting thread and
/// re-established on the worker around the operation body.
///
/// Capture once and submit many times by cloning - snapshots are independent
/// values. Dimensions that were not captured are left untouched when the
/// snapshot is established; a dimension that was captured while unset is
/// established as unset (null-capture).
#[derive(Clone, Default)]
pub struct ExecutionContext {
    captured: CaptureOptions,
    locale: Option<Locale>,
    display_locale: Option<Locale>,
    scope: Option<AmbientScope>,
    hook: Option<Arc<dyn SynchronizationHook>>,
}

impl ExecutionContext {
    /// Captures the ambient state of the calling thread, one dimension per
    /// flag enabled in `options`.
    #[must_use]
    pub fn capture(options: CaptureOptions) -> Self {
        Self {
            captured: options,
            locale: options.contains(CaptureOptions::LOCALE).then(ambient::locale),
            display_locale: options
                .contains(CaptureOptions::DISPLAY_LOCALE)
                .then(ambient::display_locale),
            scope: if options.contains(CaptureOptions::SCOPE) {
                ambient::scope()
            } else {
                None
            },
            hook: if options.contains(CaptureOptions::SYNC_HOOK) {
                ambient::synchronization_hook()
            } else {
                None
            },
        }
    }

    /// The dimensions this snapshot holds captured values for.
    #[must_use]
    pub fn captured(&self) -> CaptureOptions {
        self.captured
    }

    /// Establishes every dimension enabled in `options` (and present in this
    /// snapshot) on the calling thread, invokes `body`, and restores the
    /// previous values in reverse order on every exit path, including
    /// unwinding.
    pub(crate) fn run<R>(&self, options: CaptureOptions, body: impl FnOnce() -> R) -> R {
        let establish = self.captured & options;

        let previous_locale = establish
            .contains(CaptureOptions::LOCALE)
            .then(|| ambient::set_locale(self.locale.clone().unwrap_or_default()));
        defer! {
            if let Some(previous) = previous_locale {
                _ = ambient::set_locale(previous);
            }
        }

        let previous_display_locale = establish
            .contains(CaptureOptions::DISPLAY_LOCALE)
            .then(|| ambient::set_display_locale(self.display_locale.clone().unwrap_or_default()));
        defer! {
            if let Some(previous) = previous_display_locale {
                _ = ambient::set_display_locale(previous);
            }
        }

        let previous_scope = establish
            .contains(CaptureOptions::SCOPE)
            .then(|| ambient::set_scope(self.scope.clone()));
        defer! {
            if let Some(previous) = previous_scope {
                _ = ambient::set_scope(previous);
            }
        }

        let previous_hook = establish
            .contains(CaptureOptions::SYNC_HOOK)
            .then(|| ambient::set_synchronization_hook(self.hook.clone()));
        defer! {
            if let Some(previous) = previous_hook {
                _ = ambient::set_synchronization_hook(previous);
            }
        }

        body()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("captured", &self.captured)
            .field("locale", &self.locale)
            .field("display_locale", &self.display_locale)
            .field("has_scope", &self.scope.is_some())
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}
