// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ambient per-thread state the dispatcher can capture at submission time and
//! re-establish around an operation body.
//!
//! Four dimensions exist: the locale, the display locale, a caller-defined
//! scope value, and the synchronization hook used to schedule continuations.
//! Hosts with no meaningful equivalent for a dimension simply leave it at its
//! default; capturing such a dimension is a null-capture and establishing it
//! is a no-op in all but name.
//!
//! The functions in this module read and replace the state of the *calling*
//! thread. [`ExecutionContext`][crate::ExecutionContext] is the snapshot type
//! that moves captured values between threads.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

/// A language tag in the BCP 47 style, identifying the locale active on a
/// thread.
///
/// The dispatcher attaches no meaning to the tag beyond equality; `und`
/// (undetermined) is the default on threads where nothing was established.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locale {
    tag: Box<str>,
}

impl Locale {
    /// Creates a locale from a language tag such as `en-US`.
    pub fn new(tag: impl Into<Box<str>>) -> Self {
        Self { tag: tag.into() }
    }

    /// The language tag this locale was created from.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Default for Locale {
    fn default() -> Self {
        Self::new("und")
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

/// A caller-defined value flowed through context capture, opaque to the
/// dispatcher.
pub type AmbientScope = Arc<dyn Any + Send + Sync>;

/// Schedules continuations onto some execution context.
///
/// The dispatcher installs a hook backed by itself on the worker thread for
/// the duration of [`run()`][crate::Dispatcher::run], so continuations
/// scheduled through the ambient hook re-enter the worker as posted
/// operations. Hosts may install their own hooks on other threads and have
/// operations capture them via
/// [`CaptureOptions::SYNC_HOOK`][crate::CaptureOptions::SYNC_HOOK].
pub trait SynchronizationHook: fmt::Debug + Send + Sync {
    /// Schedules `continuation` for execution on the context this hook
    /// stands for. Must not block and must not execute the continuation
    /// inline.
    fn schedule(&self, continuation: Box<dyn FnOnce() + Send>);
}

#[derive(Default)]
struct AmbientState {
    locale: Locale,
    display_locale: Locale,
    scope: Option<AmbientScope>,
    hook: Option<Arc<dyn SynchronizationHook>>,
}

thread_local! {
    static AMBIENT: RefCell<AmbientState> = RefCell::new(AmbientState::default());
}

/// The locale of the calling thread.
#[must_use]
pub fn locale() -> Locale {
    AMBIENT.with_borrow(|ambient| ambient.locale.clone())
}

/// Replaces the locale of the calling thread, returning the previous one.
pub fn set_locale(locale: Locale) -> Locale {
    AMBIENT.with_borrow_mut(|ambient| std::mem::replace(&mut ambient.locale, locale))
}

/// The display locale of the calling thread.
#[must_use]
pub fn display_locale() -> Locale {
    AMBIENT.with_borrow(|ambient| ambient.display_locale.clone())
}

/// Replaces the display locale of the calling thread, returning the previous
/// one.
pub fn set_display_locale(locale: Locale) -> Locale {
    AMBIENT.with_borrow_mut(|ambient| std::mem::replace(&mut ambient.display_locale, locale))
}

/// The ambient scope of the calling thread, if one is established.
#[must_use]
pub fn scope() -> Option<AmbientScope> {
    AMBIENT.with_borrow(|ambient| ambient.scope.clone())
}

/// Replaces the ambient scope of the calling thread, returning the previous
/// one.
pub fn set_scope(scope: Option<AmbientScope>) -> Option<AmbientScope> {
    AMBIENT.with_borrow_mut(|ambient| std::mem::replace(&mut ambient.scope, scope))
}

/// The synchronization hook of the calling thread, if one is installed.
#[must_use]
pub fn synchronization_hook() -> Option<Arc<dyn SynchronizationHook>> {
    AMBIENT.with_borrow(|ambient| ambient.hook.clone())
}

/// Replaces the synchronization hook of the calling thread, returning the
/// previous one.
pub fn set_synchronization_hook(
    hook: Option<Arc<dyn SynchronizationHook>>,
) -> Option<Arc<dyn SynchronizationHook>> {
    AMBIENT.with_borrow_mut(|ambient| std::mem::replace(&mut ambient.hook, hook))
}
