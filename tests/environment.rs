//! End-to-end behavior of disposable test environments.
#![forbid(unsafe_code)]

use pijs_env::{
    EnvironmentConfig, Error, EvaluationStrategy, Host, HostOptions, ResourceKind,
    ResourceRequest, TestEnvironment,
};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

const TEST_URL: &str = "http://localhost/";

fn host() -> Rc<Host> {
    Host::new(HostOptions::isolated()).expect("host")
}

fn direct() -> EnvironmentConfig {
    EnvironmentConfig::new(TEST_URL)
}

fn resource_load() -> EnvironmentConfig {
    EnvironmentConfig::new(TEST_URL).with_strategy(EvaluationStrategy::ResourceLoad)
}

fn both_strategies() -> [EnvironmentConfig; 2] {
    [direct(), resource_load()]
}

#[test]
fn evaluation_is_visible_through_both_strategies() {
    for config in both_strategies() {
        let strategy = config.evaluation_strategy;
        let env = TestEnvironment::new(host(), config).expect("env");
        env.run_source_text("window.__x = 1 + 1;", "sum.test.js")
            .expect("run");
        assert_eq!(env.eval_json("window.__x").expect("read"), json!(2), "{strategy:?}");
        assert_eq!(env.global_json("__x").expect("global"), json!(2), "{strategy:?}");
    }
}

#[test]
fn throwing_source_fails_the_call_and_reports_nothing() {
    for config in both_strategies() {
        let strategy = config.evaluation_strategy;
        let env = TestEnvironment::new(host(), config).expect("env");
        let err = env
            .run_source_text("throw new Error('boom');", "boom.test.js")
            .expect_err("must throw");
        match err {
            Error::Evaluation {
                file_name, message, ..
            } => {
                assert_eq!(file_name, "boom.test.js", "{strategy:?}");
                assert!(message.contains("boom"), "{strategy:?}: {message}");
            }
            other => panic!("{strategy:?}: unexpected error {other:?}"),
        }
        assert!(env.reported_errors().expect("errors").is_empty(), "{strategy:?}");

        // The environment stays usable afterwards.
        env.run_source_text("window.after = true;", "after.test.js")
            .expect("run after throw");
        assert_eq!(env.global_json("after").expect("after"), json!(true));
    }
}

#[test]
fn thrown_non_errors_are_reported_as_uncaught_values() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    let err = env
        .run_source_text("throw 'plain';", "plain.test.js")
        .expect_err("must throw");
    assert!(err.to_string().contains("Uncaught plain"), "{err}");
}

#[test]
fn direct_evaluation_uses_the_file_name() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    env.run_source_text(
        "try { throw new Error('where'); } catch (e) { window.stack = e.stack; }",
        "named.test.js",
    )
    .expect("run");
    let stack = env.global_json("stack").expect("stack");
    assert!(
        stack.as_str().is_some_and(|stack| stack.contains("named.test.js")),
        "{stack}"
    );
}

#[test]
fn sloppy_mode_top_level_declarations_become_globals() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    env.run_source_text("var shared = 3; function twice(n) { return n * 2; }", "a.js")
        .expect("first");
    env.run_source_text("window.result = twice(shared);", "b.js")
        .expect("second");
    assert_eq!(env.global_json("result").expect("result"), json!(6));
}

#[test]
fn environments_do_not_share_globals() {
    let host = host();
    let first = TestEnvironment::new(Rc::clone(&host), direct()).expect("first");
    let second = TestEnvironment::new(Rc::clone(&host), direct()).expect("second");

    first
        .run_source_text("window.leak = 1; document.title = 'first';", "first.js")
        .expect("run");
    assert_eq!(
        second.eval_json("typeof leak").expect("typeof"),
        json!("undefined")
    );
    assert_eq!(
        second.eval_json("document.title === 'first'").expect("title"),
        json!(false)
    );
}

#[test]
fn configured_globals_are_deep_copied_per_environment() {
    let host = host();
    let config = direct().with_global("foo", json!({"n": 1, "list": [1, 2]}));

    let first = TestEnvironment::new(Rc::clone(&host), config.clone()).expect("first");
    first
        .run_source_text("foo.n = 2; foo.list.push(3);", "mutate.js")
        .expect("mutate");
    assert_eq!(first.eval_json("foo.n").expect("n"), json!(2));
    assert_eq!(first.config().globals.get("foo"), Some(&json!({"n": 1, "list": [1, 2]})));

    let second = TestEnvironment::new(Rc::clone(&host), config).expect("second");
    assert_eq!(
        second.global_json("foo").expect("foo"),
        json!({"n": 1, "list": [1, 2]})
    );
}

#[test]
fn changing_the_config_after_construction_does_not_leak() {
    let mut config = direct().with_global("foo", json!({"n": 1}));
    let env = TestEnvironment::new(host(), config.clone()).expect("env");

    config.globals.insert("foo".to_string(), json!({"n": 2}));
    config.globals.insert("late".to_string(), json!(true));

    assert_eq!(env.eval_json("foo.n").expect("n"), json!(1));
    assert_eq!(env.eval_json("typeof late").expect("late"), json!("undefined"));
    assert_eq!(env.config().globals.get("foo"), Some(&json!({"n": 1})));
}

#[test]
fn browser_like_globals_are_present() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    assert_eq!(env.eval_json("window === globalThis").expect("window"), json!(true));
    assert_eq!(env.eval_json("location.href").expect("href"), json!(TEST_URL));
    assert_eq!(env.eval_json("navigator.onLine").expect("online"), json!(true));
    assert_eq!(env.eval_json("Error.stackTraceLimit").expect("limit"), json!(100));
    assert_eq!(
        env.eval_json("typeof mockSetReadOnlyProperty").expect("mock"),
        json!("function")
    );
    assert_eq!(
        env.eval_json("Buffer.from('hello').toString('base64')")
            .expect("buffer"),
        json!("aGVsbG8=")
    );
    assert_eq!(
        env.eval_json("typeof process.nextTick").expect("process"),
        json!("function")
    );
}

#[test]
fn stack_trace_limit_follows_config() {
    let mut config = direct();
    config.stack_trace_limit = 7;
    let env = TestEnvironment::new(host(), config).expect("env");
    assert_eq!(env.eval_json("Error.stackTraceLimit").expect("limit"), json!(7));
}

#[test]
fn process_and_buffer_are_shared_across_environments() {
    let host = host();
    let first = TestEnvironment::new(Rc::clone(&host), direct()).expect("first");
    let second = TestEnvironment::new(Rc::clone(&host), direct()).expect("second");

    first
        .run_source_text("process.marker = 7; Buffer.marker = 'b';", "mark.js")
        .expect("mark");
    assert_eq!(second.eval_json("process.marker").expect("process"), json!(7));
    assert_eq!(second.eval_json("Buffer.marker").expect("buffer"), json!("b"));
}

#[test]
fn invalid_config_aborts_construction() {
    let err = TestEnvironment::new(host(), EnvironmentConfig::new("not a url"))
        .expect_err("invalid url");
    assert!(matches!(err, Error::Config(_)), "{err:?}");
}

#[test]
fn resource_load_runs_back_to_back() {
    let env = TestEnvironment::new(host(), resource_load()).expect("env");
    env.run_source_text("window.a = 1;", "a.test.js").expect("a");
    env.run_source_text("window.b = window.a + 1;", "b.test.js")
        .expect("b");
    assert_eq!(env.global_json("b").expect("b"), json!(2));
    assert!(env.reported_errors().expect("errors").is_empty());
    assert_eq!(
        env.eval_json("document.head.children.length").expect("head"),
        json!(0)
    );
}

#[test]
fn resource_load_runs_scripts_in_sloppy_mode() {
    let env = TestEnvironment::new(host(), resource_load()).expect("env");
    env.run_source_text("undeclared = 5; window.self_ok = this === window;", "s.js")
        .expect("run");
    assert_eq!(env.global_json("undeclared").expect("undeclared"), json!(5));
    assert_eq!(env.global_json("self_ok").expect("this"), json!(true));
}

#[test]
fn empty_slot_requests_fail_with_resource_not_found() {
    let env = TestEnvironment::new(host(), resource_load()).expect("env");
    let answer: Rc<RefCell<Option<pijs_env::Result<String>>>> = Rc::default();
    let sink = Rc::clone(&answer);
    env.fetch_external_resource(
        &ResourceRequest {
            url: url::Url::parse("http://localhost/missing.js").expect("url"),
            kind: ResourceKind::Script,
        },
        Box::new(move |result| *sink.borrow_mut() = Some(result)),
    );
    let answer = answer.borrow_mut().take().expect("answered synchronously");
    let err = answer.expect_err("slot was empty");
    assert_eq!(err.to_string(), "Unable to find source for http://localhost/missing.js");
}

#[test]
fn scripts_added_by_source_without_a_pending_script_are_reported() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    env.run_source_text(
        "const s = document.createElement('script'); \
         s.src = 'extra.js'; \
         s.onerror = () => { window.failed = true; }; \
         document.head.appendChild(s);",
        "adds-script.js",
    )
    .expect("run");
    assert_eq!(env.global_json("failed").expect("failed"), json!(true));
    assert_eq!(
        env.reported_errors().expect("errors"),
        vec!["Unable to find source for http://localhost/extra.js".to_string()]
    );
}

#[test]
fn fake_timers_are_installed_by_default() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    env.run_source_text(
        "window.fired = false; setTimeout(() => { window.fired = true; }, 1000);",
        "timer.js",
    )
    .expect("run");
    assert_eq!(env.timer_count().expect("count"), 1);

    env.advance_timers_by_time(999).expect("advance");
    assert_eq!(env.global_json("fired").expect("fired"), json!(false));
    env.advance_timers_by_time(1).expect("advance");
    assert_eq!(env.global_json("fired").expect("fired"), json!(true));
    assert_eq!(env.now().expect("now"), 1000);
}

#[test]
fn immediates_are_faked_too() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    env.run_source_text(
        "window.order = []; setImmediate(() => order.push('i')); setTimeout(() => order.push('t'), 0);",
        "immediate.js",
    )
    .expect("run");
    assert_eq!(env.host().run_immediates().expect("host immediates"), 0);
    assert_eq!(env.run_all_timers().expect("run all"), 2);
    assert_eq!(env.global_json("order").expect("order"), json!(["i", "t"]));
}

#[test]
fn timer_callback_errors_surface_from_the_driver() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    env.run_source_text("setTimeout(() => { throw new Error('late boom'); }, 5);", "t.js")
        .expect("run");
    let err = env.run_all_timers().expect_err("callback threw");
    assert!(err.to_string().contains("late boom"), "{err}");
}

#[test]
fn real_timers_are_available_temporarily() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    env.run_with_real_timers(|ctx| {
        ctx.eval::<(), _>("setTimeout(() => { window.realFired = true; }, 0);")
            .expect("schedule real timer");
    })
    .expect("real timers");
    assert_eq!(env.timer_count().expect("count"), 0);
    assert_eq!(env.run_due_real_timers().expect("due"), 1);
    assert_eq!(env.global_json("realFired").expect("fired"), json!(true));

    env.run_source_text("setTimeout(() => {}, 10);", "fake-again.js")
        .expect("run");
    assert_eq!(env.timer_count().expect("count"), 1);
}

#[test]
fn real_timer_ids_do_not_cancel_fake_timers() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    env.run_with_real_timers(|ctx| {
        ctx.eval::<(), _>("window.realId = setTimeout(() => {}, 60000);")
            .expect("schedule real timer");
    })
    .expect("real timers");

    env.run_source_text(
        "window.fired = false; \
         window.fakeId = setTimeout(() => { window.fired = true; }, 10); \
         clearTimeout(realId);",
        "cross-ids.js",
    )
    .expect("run");
    assert_ne!(
        env.global_json("realId").expect("real id"),
        env.global_json("fakeId").expect("fake id")
    );

    assert_eq!(env.run_all_timers().expect("run all"), 1);
    assert_eq!(env.global_json("fired").expect("fired"), json!(true));
}

#[test]
fn fakes_come_back_after_the_callback_fails() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    let outcome = env
        .run_with_real_timers(|ctx| {
            ctx.eval::<(), _>("throw new Error('inside');").map_err(|_| {
                let _ = ctx.catch();
                "thrown"
            })
        })
        .expect("real timers");
    assert_eq!(outcome, Err("thrown"));

    env.run_source_text("setTimeout(() => {}, 10);", "after-error.js")
        .expect("run");
    assert_eq!(env.timer_count().expect("count"), 1);
}

#[test]
fn fakes_come_back_after_the_callback_panics() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    let caught = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = env.run_with_real_timers(|_ctx| -> u8 { panic!("inside real timers") });
    }));
    assert!(caught.is_err());

    env.run_source_text("setTimeout(() => {}, 10);", "after-panic.js")
        .expect("run");
    assert_eq!(env.timer_count().expect("count"), 1);
}

#[test]
fn microtasks_drain_on_demand() {
    let env = TestEnvironment::new(host(), direct()).expect("env");
    env.run_source_text(
        "window.done = false; Promise.resolve().then(() => { window.done = true; });",
        "promise.js",
    )
    .expect("run");
    assert_eq!(env.global_json("done").expect("done"), json!(false));
    assert!(env.run_microtasks().expect("drain") >= 1);
    assert_eq!(env.global_json("done").expect("done"), json!(true));
}

#[test]
fn dispose_is_idempotent_and_runs_close_hooks_once() {
    let closed = Rc::new(Cell::new(0));
    let mut env = TestEnvironment::new(host(), direct()).expect("env");
    let counter = Rc::clone(&closed);
    env.on_close(move || counter.set(counter.get() + 1))
        .expect("hook");
    env.run_source_text("setTimeout(() => {}, 10);", "pending.js")
        .expect("run");

    env.dispose();
    env.dispose();
    assert!(env.is_disposed());
    assert_eq!(closed.get(), 1);

    assert!(matches!(
        env.run_source_text("1", "late.js"),
        Err(Error::Disposed)
    ));
    assert!(matches!(env.run_all_timers(), Err(Error::Disposed)));
    assert!(matches!(env.on_close(|| {}), Err(Error::Disposed)));
    drop(env);
    assert_eq!(closed.get(), 1);
}

#[test]
fn dispose_settles_its_own_promise_jobs() {
    let host = host();
    let mut first = TestEnvironment::new(Rc::clone(&host), direct()).expect("first");
    let second = TestEnvironment::new(Rc::clone(&host), direct()).expect("second");

    first
        .run_source_text(
            "Promise.resolve().then(() => { process.settledBy = 'first'; }); \
             Promise.reject(new Error('ignored')).then(() => {});",
            "pending-jobs.js",
        )
        .expect("run");
    first.dispose();

    assert_eq!(
        second.eval_json("process.settledBy").expect("settled"),
        json!("first")
    );
    assert_eq!(second.run_microtasks().expect("drain"), 0);
}

#[test]
fn dropping_an_environment_disposes_it() {
    let closed = Rc::new(Cell::new(false));
    {
        let mut env = TestEnvironment::new(host(), direct()).expect("env");
        let flag = Rc::clone(&closed);
        env.on_close(move || flag.set(true)).expect("hook");
    }
    assert!(closed.get());
}
