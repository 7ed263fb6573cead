// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Context capture: operations observe the submitter's ambient state when
//! asked to, and the worker's ambient state is restored afterwards.

use std::sync::Arc;

use usher::ambient::{self, Locale};
use usher::{
    CaptureOptions, Dispatcher, DispatcherHost, ExecutionContext, ShutdownMode, SubmitOptions,
};

#[test]
fn captured_locale_is_observed_by_the_body() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    _ = ambient::set_locale(Locale::new("de-DE"));

    let captured = dispatcher
        .send_with(
            SubmitOptions::new().with_capture(CaptureOptions::LOCALE),
            None,
            || ambient::locale(),
        )
        .unwrap();
    assert_eq!(captured.tag(), "de-DE");

    // Without capture the body observes the worker's own ambient locale.
    let uncaptured = dispatcher
        .send_with(
            SubmitOptions::new().with_capture(CaptureOptions::empty()),
            None,
            || ambient::locale(),
        )
        .unwrap();
    assert_eq!(uncaptured.tag(), "und");

    _ = ambient::set_locale(Locale::default());
    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn worker_locale_is_restored_after_the_body() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    _ = ambient::set_locale(Locale::new("fr-FR"));

    dispatcher
        .send_with(
            SubmitOptions::new().with_capture(CaptureOptions::LOCALE),
            None,
            || assert_eq!(ambient::locale().tag(), "fr-FR"),
        )
        .unwrap();

    // A subsequent uncaptured body sees the worker's pristine ambient state.
    let after = dispatcher.send(|| ambient::locale()).unwrap();
    assert_eq!(after.tag(), "und");

    _ = ambient::set_locale(Locale::default());
    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn default_options_from_the_builder_apply_to_plain_posts() {
    let dispatcher = Dispatcher::builder()
        .with_default_options(CaptureOptions::LOCALE | CaptureOptions::DISPLAY_LOCALE)
        .build()
        .unwrap();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    _ = ambient::set_locale(Locale::new("ja-JP"));
    _ = ambient::set_display_locale(Locale::new("en-GB"));

    let observed = dispatcher
        .send(|| (ambient::locale(), ambient::display_locale()))
        .unwrap();
    assert_eq!(observed.0.tag(), "ja-JP");
    assert_eq!(observed.1.tag(), "en-GB");

    _ = ambient::set_locale(Locale::default());
    _ = ambient::set_display_locale(Locale::default());
    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn captured_scope_flows_to_the_body() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    _ = ambient::set_scope(Some(Arc::new("request-1234".to_string())));

    let observed = dispatcher
        .send_with(
            SubmitOptions::new().with_capture(CaptureOptions::SCOPE),
            None,
            || {
                ambient::scope()
                    .and_then(|scope| scope.downcast_ref::<String>().cloned())
            },
        )
        .unwrap();
    assert_eq!(observed.as_deref(), Some("request-1234"));

    _ = ambient::set_scope(None);
    host.shutdown(ShutdownMode::FinishPending).unwrap();
}

#[test]
fn a_context_captured_once_can_be_submitted_many_times() {
    let dispatcher = Dispatcher::new();
    let host = DispatcherHost::start(dispatcher.clone()).unwrap();

    _ = ambient::set_locale(Locale::new("it-IT"));
    let context = ExecutionContext::capture(CaptureOptions::LOCALE);
    _ = ambient::set_locale(Locale::default());

    for _ in 0..3 {
        let observed = dispatcher
            .send_with(
                SubmitOptions::new()
                    .with_capture(CaptureOptions::LOCALE)
                    .with_context(context.clone()),
                None,
                || ambient::locale(),
            )
            .unwrap();
        assert_eq!(observed.tag(), "it-IT");
    }

    host.shutdown(ShutdownMode::FinishPending).unwrap();
}
