//! Lifecycle state machine: creation, initialization, finalization, exit,
//! disposal, patching and context close.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::*;
use polyhost::{
    AccessPolicy, ContextConfig, ExitMode, LanguageInfo, LifecycleError, LifecycleEvent,
    LifecyclePhase, SandboxPolicy,
};

fn generation(ctx: &polyhost::Context, id: &str) -> u64 {
    ctx.language(id)
        .unwrap()
        .env()
        .expect("created")
        .state::<EnvState>()
        .expect("test state")
        .generation
}

#[test]
fn concurrent_initialization_runs_body_once() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    lang.on("post_init", |_| {
        thread::sleep(Duration::from_millis(30));
        Ok(())
    });
    let ctx = context(&engine);
    let n = 8;
    let barrier = Arc::new(Barrier::new(n));

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let ctx = ctx.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let lc = ctx.language("js").unwrap();
                let ran = lc.ensure_initialized(None).unwrap();
                (ran, lc.is_initialized())
            })
        })
        .collect();
    let results: Vec<(bool, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|(ran, _)| *ran).count(), 1);
    assert!(results.iter().all(|(_, initialized)| *initialized));
    assert_eq!(lang.count("create_env"), 1);
    assert_eq!(lang.count("post_init"), 1);
}

#[test]
fn reentrant_creation_reports_cyclic_access() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    let cell = ContextCell::default();
    let saw_cycle = Arc::new(AtomicBool::new(false));
    {
        let cell = cell.clone();
        let saw_cycle = saw_cycle.clone();
        lang.on("create_env", move |_| {
            let ctx = cell.get();
            match ctx.language("js").unwrap().ensure_created(None) {
                Err(LifecycleError::CyclicAccess { language }) => {
                    assert_eq!(language, "js");
                    saw_cycle.store(true, Ordering::SeqCst);
                    Ok(())
                }
                other => Err(guest(&format!("unexpected: {other:?}"))),
            }
        });
    }
    let ctx = context(&engine);
    cell.set(&ctx);

    let (tx, rx) = mpsc::channel();
    let worker = ctx.clone();
    thread::spawn(move || {
        let res = worker.language("js").unwrap().ensure_created(None);
        let _ = tx.send(res.map_err(|e| e.to_string()));
    });
    let outcome = rx.recv_timeout(WAIT).expect("no deadlock");
    assert_eq!(outcome, Ok(true));
    assert!(saw_cycle.load(Ordering::SeqCst));
}

#[test]
fn dispose_then_recreate_starts_from_scratch() {
    let lang_info = LanguageInfo::new("js").offers("Parser");
    let (engine, lang) = single(lang_info);
    *lang.service.lock() = Some("js.Parser");
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();

    assert!(js.ensure_initialized(None).unwrap());
    let first_instance = js.instance().unwrap().id();
    assert_eq!(generation(&ctx, "js"), 1);
    assert!(js.lookup_service::<TestService>().is_some());

    assert!(js.dispose().unwrap());
    assert!(!js.is_created());
    assert!(!js.is_initialized());
    assert_eq!(js.phase(), LifecyclePhase::Uncreated);
    assert!(js.env().is_none());
    assert!(js.accessible_languages(true).is_none());
    assert!(js.lookup_service::<TestService>().is_none());
    assert_eq!(lang.count("dispose"), 1);

    assert!(js.ensure_created(None).unwrap());
    assert_eq!(js.phase(), LifecyclePhase::Created);
    assert_eq!(generation(&ctx, "js"), 2);
    assert_ne!(js.instance().unwrap().id(), first_instance);
    assert_eq!(lang.count("create_env"), 2);
    assert_eq!(lang.count("post_init"), 1);
}

#[test]
fn dispose_of_uncreated_language_is_noop() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    let ctx = context(&engine);
    assert!(!ctx.language("js").unwrap().dispose().unwrap());
    assert_eq!(lang.count("dispose"), 0);
}

#[test]
fn disposal_in_progress_runs_once_and_blocks_recreation() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    let started = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    {
        let started = started.clone();
        let release = release.clone();
        lang.on("dispose", move |_| {
            started.wait();
            release.wait();
            Ok(())
        });
    }
    let ctx = context(&engine);
    ctx.language("js").unwrap().ensure_initialized(None).unwrap();

    let disposer = {
        let ctx = ctx.clone();
        thread::spawn(move || ctx.language("js").unwrap().dispose())
    };
    started.wait();

    let js = ctx.language("js").unwrap();
    assert!(!js.dispose().unwrap());
    assert!(matches!(
        js.ensure_created(None),
        Err(LifecycleError::CreationNotAllowed { .. })
    ));
    assert!(matches!(
        js.ensure_initialized(None),
        Err(LifecycleError::CreationNotAllowed { .. })
    ));

    release.wait();
    assert!(disposer.join().unwrap().unwrap());
    assert_eq!(lang.count("dispose"), 1);
    assert!(!js.is_created());
    assert!(js.env().is_none());

    // the flag goes away with the teardown
    assert!(js.ensure_initialized(None).unwrap());
    assert_eq!(generation(&ctx, "js"), 2);
}

#[test]
fn exit_follows_severity_ordering() {
    let (engine, lang) = single(LanguageInfo::new("js"));

    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();
    assert!(js.exit_context(ExitMode::Natural, 0).unwrap());
    assert!(js.exit_context(ExitMode::Hard, 1).unwrap());
    assert_eq!(lang.count("exit"), 2);
    assert_eq!(js.phase(), LifecyclePhase::Exited(ExitMode::Hard));

    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();
    assert!(js.exit_context(ExitMode::Hard, 1).unwrap());
    assert!(!js.exit_context(ExitMode::Natural, 0).unwrap());
    assert!(!js.exit_context(ExitMode::Hard, 2).unwrap());
    assert_eq!(lang.count("exit"), 3);
}

#[test]
fn hard_exit_swallows_guest_failures_only() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    lang.on("exit", |_| Err(guest("exit handler threw")));
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();
    assert!(js.exit_context(ExitMode::Hard, 1).is_ok());

    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();
    assert!(js.exit_context(ExitMode::Natural, 0).is_err());

    lang.on("exit", |_| Err(internal("broken exit")));
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();
    let err = js.exit_context(ExitMode::Hard, 1).unwrap_err();
    assert!(err.is_internal());
}

#[test]
fn patch_of_uncreated_language_skips_factory() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    let ctx = context(&engine);
    assert!(ctx.language("js").unwrap().patch(&ContextConfig::default()).unwrap());
    assert!(ctx.patch(ContextConfig::default()).unwrap());
    assert_eq!(lang.count("create_env"), 0);
    assert_eq!(lang.count("patch_env"), 0);
}

#[test]
fn rejected_patch_keeps_old_environment() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();
    let before = js.env().unwrap();

    let mut next = ContextConfig::default();
    next.poll_interval = Duration::from_millis(50);
    assert!(!js.patch(&next).unwrap());
    assert!(!ctx.patch(next).unwrap());

    let after = js.env().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(generation(&ctx, "js"), 1);
    assert_eq!(ctx.config().poll_interval, Duration::from_millis(5));
    // still usable
    assert!(!js.ensure_initialized(None).unwrap());
    assert_eq!(lang.count("patch_env"), 2);
}

#[test]
fn accepted_patch_swaps_environment_and_access() {
    let js_lang = TestLanguage::new();
    let py_lang = TestLanguage::new();
    js_lang.patchable.store(true, Ordering::SeqCst);
    let engine = engine(vec![
        (LanguageInfo::new("js"), js_lang.clone()),
        (LanguageInfo::new("python"), py_lang),
    ]);
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();
    assert!(js.accessible_languages(false).unwrap().contains_key("python"));

    let mut next = ContextConfig::default();
    next.access = AccessPolicy::default().allow(["js"]);
    assert!(ctx.patch(next).unwrap());

    assert_eq!(generation(&ctx, "js"), 2);
    let public = js.accessible_languages(false).unwrap();
    assert!(public.contains_key("js"));
    assert!(!public.contains_key("python"));
    assert!(ctx.config().access.allowed_languages.contains("js"));
}

#[test]
fn context_patch_is_all_or_nothing() {
    let js_lang = TestLanguage::new();
    let py_lang = TestLanguage::new();
    js_lang.patchable.store(true, Ordering::SeqCst);
    let engine = engine(vec![
        (LanguageInfo::new("js"), js_lang.clone()),
        (LanguageInfo::new("python"), py_lang.clone()),
    ]);
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();
    ctx.language("python").unwrap().ensure_initialized(None).unwrap();
    let before = js.env().unwrap();

    let mut next = ContextConfig::default();
    next.access = AccessPolicy::default().allow(["js"]);
    assert!(!ctx.patch(next).unwrap());

    // js accepted, python rejected: nothing is published
    assert_eq!(js_lang.count("patch_env"), 1);
    assert_eq!(py_lang.count("patch_env"), 1);
    assert!(Arc::ptr_eq(&before, &js.env().unwrap()));
    assert_eq!(generation(&ctx, "js"), 1);
    assert!(js.accessible_languages(false).unwrap().contains_key("python"));
    assert!(ctx.config().access.allowed_languages.is_empty());
}

#[test]
fn patch_outside_configured_languages_leaves_environment() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_created(None).unwrap();

    let mut next = ContextConfig::default();
    next.languages.insert("python".into());
    assert!(js.patch(&next).unwrap());
    assert_eq!(lang.count("patch_env"), 0);
    assert_eq!(generation(&ctx, "js"), 1);
}

#[test]
fn finalize_is_idempotent_and_best_effort() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    lang.on("finalize", |_| Err(guest("finalizer threw")));

    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    assert!(!js.finalize_context(false).unwrap());
    js.ensure_initialized(None).unwrap();
    assert!(js.finalize_context(false).unwrap());
    assert!(!js.finalize_context(false).unwrap());
    assert_eq!(lang.count("finalize"), 1);
    assert_eq!(js.phase(), LifecyclePhase::Finalized);

    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();
    let err = js.finalize_context(true).unwrap_err();
    assert!(matches!(err, LifecycleError::Hook { operation: "finalize", .. }));

    lang.on("finalize", |_| Err(internal("finalizer bug")));
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();
    assert!(js.finalize_context(false).unwrap_err().is_internal());
}

#[test]
fn failed_initialization_rolls_back_and_can_be_retried() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    let sink = RecordingSink::new();
    let engine = engine.with_sink(sink.clone());
    let fail_once = Arc::new(AtomicBool::new(true));
    {
        let fail_once = fail_once.clone();
        lang.on("post_init", move |_| {
            if fail_once.swap(false, Ordering::SeqCst) {
                Err(guest("init script failed"))
            } else {
                Ok(())
            }
        });
    }
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();

    let err = js.ensure_initialized(None).unwrap_err();
    assert!(matches!(err, LifecycleError::Hook { operation: "post_init", .. }));
    assert!(!js.is_initialized());
    assert!(js.initialization_failed());
    assert!(js.is_created());

    assert!(js.ensure_initialized(None).unwrap());
    assert!(js.is_initialized());
    assert!(!js.initialization_failed());
    assert_eq!(
        sink.events_for("js"),
        vec![
            LifecycleEvent::Create,
            LifecycleEvent::Created,
            LifecycleEvent::Initialize,
            LifecycleEvent::InitializeFailed,
            LifecycleEvent::Initialize,
            LifecycleEvent::Initialized,
        ]
    );
}

#[test]
fn reentrant_use_during_initialization_is_allowed() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    let cell = ContextCell::default();
    {
        let cell = cell.clone();
        lang.on("post_init", move |_| {
            let ctx = cell.get();
            match ctx.language("js").unwrap().ensure_initialized(None) {
                Ok(false) => Ok(()),
                other => Err(guest(&format!("unexpected: {other:?}"))),
            }
        });
    }
    let ctx = context(&engine);
    cell.set(&ctx);
    assert!(ctx.language("js").unwrap().ensure_initialized(None).unwrap());
}

#[test]
fn notifications_follow_lifecycle_and_sink_failures_are_ignored() {
    let (engine, _lang) = single(LanguageInfo::new("js"));
    let sink = RecordingSink::new();
    sink.fail.store(true, Ordering::SeqCst);
    let engine = engine.with_sink(sink.clone());
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();

    js.ensure_initialized(None).unwrap();
    js.finalize_context(true).unwrap();
    js.dispose().unwrap();

    assert_eq!(
        sink.events_for("js"),
        vec![
            LifecycleEvent::Create,
            LifecycleEvent::Created,
            LifecycleEvent::Initialize,
            LifecycleEvent::Initialized,
            LifecycleEvent::Finalized,
            LifecycleEvent::Disposed,
        ]
    );
}

#[test]
fn failed_creation_leaves_no_partial_state() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    let sink = RecordingSink::new();
    let engine = engine.with_sink(sink.clone());
    lang.on("create_env", |_| Err(guest("bad options")));
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();

    let err = js.ensure_created(None).unwrap_err();
    assert!(matches!(err, LifecycleError::Hook { operation: "create_env", .. }));
    assert!(!js.is_created());
    assert!(js.env().is_none());
    assert!(js.instance().is_none());
    assert_eq!(sink.events_for("js"), vec![LifecycleEvent::Create, LifecycleEvent::CreateFailed]);

    lang.on("create_env", |_| Ok(()));
    assert!(js.ensure_created(None).unwrap());
}

#[test]
fn sandbox_policy_is_checked_before_creation() {
    let (engine, lang) = single(LanguageInfo::new("js").with_sandbox(SandboxPolicy::Constrained));
    let mut config = ContextConfig::default();
    config.sandbox = SandboxPolicy::Isolated;
    let ctx = engine.create_context(config);

    let err = ctx.language("js").unwrap().ensure_created(None).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::SandboxViolation {
            policy: SandboxPolicy::Isolated,
            ..
        }
    ));
    assert_eq!(lang.count("create_env"), 0);
}

#[test]
fn access_is_checked_against_the_accessing_language() {
    let js_lang = TestLanguage::new();
    let engine = engine(vec![
        (LanguageInfo::new("js").depends_on(["regex"]), js_lang),
        (LanguageInfo::new("python"), TestLanguage::new()),
        (LanguageInfo::new("regex").internal(), TestLanguage::new()),
    ]);
    let mut config = ContextConfig::default();
    config.access = AccessPolicy::default().allow(["js"]);
    let ctx = engine.create_context(config);
    let js_info: LanguageInfo = (**ctx.language("js").unwrap().info()).clone();

    let python = ctx.language("python").unwrap();
    assert!(matches!(
        python.ensure_created(None),
        Err(LifecycleError::AccessDenied { .. })
    ));
    assert!(matches!(
        python.ensure_created(Some(&js_info)),
        Err(LifecycleError::AccessDenied { .. })
    ));

    let regex = ctx.language("regex").unwrap();
    assert!(regex.check_access(None).is_err());
    assert!(regex.ensure_created(Some(&js_info)).unwrap());

    let js = ctx.language("js").unwrap();
    js.ensure_created(None).unwrap();
    let internal = js.accessible_languages(true).unwrap();
    assert!(internal.contains_key("regex"));
    assert!(!internal.contains_key("python"));
    assert!(js.is_eval_allowed(Some(&js_info)));
    assert!(!js.is_eval_allowed(Some(&**python.info())));
}

#[test]
fn empty_eval_override_denies_all_evaluation() {
    let (engine, _lang) = single(LanguageInfo::new("js"));
    let mut config = ContextConfig::default();
    config.access = AccessPolicy::default().with_eval_access("js", Vec::<String>::new());
    let ctx = engine.create_context(config);
    let js = ctx.language("js").unwrap();
    js.ensure_created(None).unwrap();
    assert!(!js.is_eval_allowed(None));
}

#[test]
fn missing_declared_service_fails_creation() {
    let (engine, lang) = single(LanguageInfo::new("js").offers("Parser"));
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();

    for _ in 0..2 {
        match js.ensure_created(None).unwrap_err() {
            LifecycleError::MissingService { language, service } => {
                assert_eq!(language, "js");
                assert_eq!(service.as_str(), "Parser");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!js.is_created());
    }

    *lang.service.lock() = Some("js.Parser");
    js.ensure_created(None).unwrap();
    let service = js.lookup_service::<TestService>().unwrap();
    assert_eq!(service.language, "js");
    assert!(js
        .lookup_service_by_id(&polyhost::ServiceId::from("Service"))
        .is_some());
}

#[test]
fn dispose_with_live_owned_threads_is_internal_error() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_initialized(None).unwrap();

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let worker = js
        .spawn_thread("js-worker", move || {
            let _ = started_tx.send(());
            release_rx.recv_timeout(WAIT).is_ok()
        })
        .unwrap();
    started_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(js.owned_threads().len(), 1);

    let err = js.dispose().unwrap_err();
    assert!(matches!(err, LifecycleError::OwnedThreadsAlive { .. }));
    assert!(err.is_internal());
    assert!(js.is_created());

    release_tx.send(()).unwrap();
    assert!(worker.join().unwrap().unwrap());
    assert!(js.owned_threads().is_empty());
    assert!(js.dispose().unwrap());
    assert_eq!(lang.count("dispose"), 1);
}

#[test]
fn guest_failure_in_dispose_is_reported_after_teardown() {
    let (engine, lang) = single(LanguageInfo::new("js"));
    lang.on("dispose", |_| Err(guest("dispose ran guest code")));
    let ctx = context(&engine);
    let js = ctx.language("js").unwrap();
    js.ensure_created(None).unwrap();

    let err = js.dispose().unwrap_err();
    assert!(matches!(err, LifecycleError::GuestCodeDuringDisposal { .. }));
    assert!(!js.is_created());
}

#[test]
fn close_finalizes_until_stable_then_retires_context() {
    let js_lang = TestLanguage::new();
    let py_lang = TestLanguage::new();
    let engine = engine(vec![
        (LanguageInfo::new("js"), js_lang.clone()),
        (LanguageInfo::new("python"), py_lang.clone()),
    ]);
    let ctx = context(&engine);
    let cell = ContextCell::default();
    cell.set(&ctx);
    {
        let cell = cell.clone();
        js_lang.on("finalize", move |_| {
            let ctx = cell.get();
            ctx.language("python")
                .unwrap()
                .ensure_initialized(None)
                .map(|_| ())
                .map_err(|e| guest(&e.to_string()))
        });
    }

    let _entered = ctx.enter().unwrap();
    ctx.language("js").unwrap().ensure_initialized(None).unwrap();
    ctx.close().unwrap();

    assert!(ctx.is_closed());
    assert_eq!(js_lang.count("finalize"), 1);
    assert_eq!(py_lang.count("post_init"), 1);
    assert_eq!(py_lang.count("finalize"), 1);
    assert_eq!(js_lang.count("dispose"), 1);
    assert_eq!(py_lang.count("dispose"), 1);
    assert_eq!(js_lang.count("dispose_thread"), 1);

    let js = ctx.language("js").unwrap();
    assert!(!js.is_created());
    assert!(matches!(js.ensure_created(None), Err(LifecycleError::Closed)));
    assert!(ctx.close().is_ok());
}

#[test]
fn initialization_on_finalized_thread_is_refused_during_close() {
    let js_lang = TestLanguage::new();
    let ruby_lang = TestLanguage::new();
    let engine = engine(vec![
        (LanguageInfo::new("js"), js_lang.clone()),
        (LanguageInfo::new("ruby"), ruby_lang.clone()),
    ]);
    let cell = ContextCell::default();
    let seen = Arc::new(parking_lot::Mutex::new(None));
    {
        let cell = cell.clone();
        let seen = seen.clone();
        // ruby is disposed first and reaches into js from its dispose hook
        ruby_lang.on("dispose", move |_| {
            let ctx = cell.get();
            *seen.lock() = Some(ctx.language("js").unwrap().ensure_initialized(None));
            Ok(())
        });
    }
    let ctx = context(&engine);
    cell.set(&ctx);
    let _entered = ctx.enter().unwrap();
    ctx.language("js").unwrap().ensure_created(None).unwrap();
    ctx.language("ruby").unwrap().ensure_initialized(None).unwrap();

    ctx.close().unwrap();

    match seen.lock().take() {
        Some(Err(LifecycleError::ThreadFinalized { language })) => assert_eq!(language, "js"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(js_lang.count("post_init"), 0);
    assert_eq!(js_lang.count("dispose"), 1);
    assert!(ctx.is_closed());
}

#[test]
fn exit_notifies_every_initialized_language() {
    let js_lang = TestLanguage::new();
    let py_lang = TestLanguage::new();
    let engine = engine(vec![
        (LanguageInfo::new("js"), js_lang.clone()),
        (LanguageInfo::new("python"), py_lang.clone()),
    ]);
    let ctx = context(&engine);
    ctx.language("js").unwrap().ensure_initialized(None).unwrap();
    ctx.exit(3).unwrap();
    assert_eq!(js_lang.count("exit"), 1);
    assert_eq!(py_lang.count("exit"), 0);
}

#[test]
fn unknown_language_is_reported() {
    let (engine, _lang) = single(LanguageInfo::new("js"));
    let ctx = context(&engine);
    assert!(matches!(
        ctx.language("cobol"),
        Err(LifecycleError::UnknownLanguage(id)) if id == "cobol"
    ));
}
