//! Per-test JavaScript environments.
//!
//! A [`TestEnvironment`] owns one fresh [`Scope`] from the [`Host`] and one
//! [`FakeTimers`] controller installed over it. Source text is evaluated
//! either directly in the scope's context or by injecting a `<script src>`
//! element whose request is answered from a one-shot [`PendingScript`] slot.

use crate::config::{EnvironmentConfig, EvaluationStrategy};
use crate::convert::{caught_to_error, deep_copy, js_to_json, json_to_js};
use crate::error::{Error, Result};
use crate::fake_timers::FakeTimers;
use crate::host::Host;
use crate::scope::{ResourceCallback, ResourceLoader, ResourceRequest, Scope, ScopeFeatures};
use rquickjs::context::EvalOptions;
use rquickjs::function::This;
use rquickjs::{Ctx, Function, Object, Value};
use std::cell::RefCell;
use std::rc::Rc;

const EVAL_FILE: &str = "<eval>";

/// Single-slot hand-off between `run_source_text` and the resource loader.
#[derive(Debug, Default)]
pub struct PendingScript {
    slot: RefCell<Option<(String, String)>>,
}

impl PendingScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `source` for the next request. Refuses while another script is
    /// still waiting to be served.
    pub fn offer(&self, file_name: &str, source: String) -> Result<()> {
        let mut slot = self.slot.borrow_mut();
        if let Some((pending, _)) = slot.as_ref() {
            return Err(Error::PendingScriptBusy {
                pending: pending.clone(),
            });
        }
        *slot = Some((file_name.to_string(), source));
        Ok(())
    }

    /// Read and clear the slot.
    pub fn take(&self) -> Option<String> {
        self.slot.borrow_mut().take().map(|(_, source)| source)
    }

    pub fn is_empty(&self) -> bool {
        self.slot.borrow().is_none()
    }

    /// Answer a resource request from the slot, clearing it either way.
    pub fn serve(&self, request: &ResourceRequest, callback: ResourceCallback) {
        match self.take() {
            Some(source) => callback(Ok(source)),
            None => callback(Err(Error::resource_not_found(request.url.as_str()))),
        }
    }
}

struct Live {
    // Dropped before the scope whose context it points into.
    fake_timers: FakeTimers,
    scope: Scope,
}

pub struct TestEnvironment {
    live: Option<Live>,
    pending: Rc<PendingScript>,
    config: EnvironmentConfig,
    host: Rc<Host>,
}

impl std::fmt::Debug for TestEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnvironment")
            .field("test_url", &self.config.test_url)
            .field("strategy", &self.config.evaluation_strategy)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl TestEnvironment {
    /// Build a fresh environment. Any failure aborts construction; no
    /// partially set up environment is returned.
    pub fn new(host: Rc<Host>, config: EnvironmentConfig) -> Result<Self> {
        config.validate()?;

        let pending = Rc::new(PendingScript::new());
        let serving = Rc::clone(&pending);
        let loader: ResourceLoader = Rc::new(move |request: &ResourceRequest, callback: ResourceCallback| {
            serving.serve(request, callback);
        });
        let scope = host.create_scope(&config.test_url, loader, ScopeFeatures::scripts())?;
        scope.set_online(true)?;

        let fake_timers = scope.with(|ctx| -> Result<FakeTimers> {
            let globals = ctx.globals();
            let error_ctor: Object<'_> = globals.get("Error")?;
            error_ctor.set("stackTraceLimit", config.stack_trace_limit)?;

            globals.set("Buffer", host.buffer(&ctx)?)?;
            globals.set("process", host.process(&ctx)?)?;
            if let Some((set_immediate, clear_immediate)) = host.immediates(&ctx)? {
                globals.set("setImmediate", set_immediate)?;
                globals.set("clearImmediate", clear_immediate)?;
            }

            let fake_timers =
                FakeTimers::install_with_ids(&ctx, config.max_timer_loops, host.timer_ids())?;
            install_mock_set_read_only_property(&ctx)?;

            for (name, value) in &config.globals {
                globals.set(name.as_str(), json_to_js(&ctx, &deep_copy(value))?)?;
            }
            Ok(fake_timers)
        })??;

        tracing::debug!(
            event = "env.create",
            test_url = %config.test_url,
            strategy = ?config.evaluation_strategy,
            globals = config.globals.len(),
            "Created test environment"
        );
        Ok(Self {
            live: Some(Live { fake_timers, scope }),
            pending,
            config,
            host,
        })
    }

    pub const fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub const fn strategy(&self) -> EvaluationStrategy {
        self.config.evaluation_strategy
    }

    pub const fn host(&self) -> &Rc<Host> {
        &self.host
    }

    pub const fn is_disposed(&self) -> bool {
        self.live.is_none()
    }

    fn live(&self) -> Result<&Live> {
        self.live.as_ref().ok_or(Error::Disposed)
    }

    /// Evaluate `source_text` as if it were the file `file_name`.
    ///
    /// Returns once top-level evaluation finishes; timers and promise jobs
    /// it schedules stay queued. Calling this from inside a script that is
    /// itself being run through [`EvaluationStrategy::ResourceLoad`] is not
    /// supported.
    pub fn run_source_text(&self, source_text: &str, file_name: &str) -> Result<()> {
        let live = self.live()?;
        tracing::trace!(event = "env.run", file_name, strategy = ?self.strategy(), "Running source text");
        match self.strategy() {
            EvaluationStrategy::Direct => live
                .scope
                .with(|ctx| eval_script(&ctx, source_text, file_name))?,
            EvaluationStrategy::ResourceLoad => {
                self.run_through_resource_loader(live, source_text, file_name)
            }
        }
    }

    fn run_through_resource_loader(
        &self,
        live: &Live,
        source_text: &str,
        file_name: &str,
    ) -> Result<()> {
        self.pending.offer(file_name, source_text.to_string())?;
        let outcome = live.scope.with(|ctx| -> Result<()> {
            let document: Object<'_> = ctx.globals().get("document")?;
            let head: Object<'_> = document.get("head")?;
            let create_element: Function<'_> = document.get("createElement")?;
            let script: Object<'_> = create_element.call((This(document), "script"))?;
            script.set("src", file_name)?;

            let append_child: Function<'_> = head.get("appendChild")?;
            let appended = append_child
                .call::<_, ()>((This(head.clone()), script.clone()))
                .map_err(|err| caught_to_error(&ctx, err, file_name));
            let remove_child: Function<'_> = head.get("removeChild")?;
            remove_child.call::<_, ()>((This(head), script))?;
            appended
        });

        // The slot must not outlive this call, whatever happened above.
        let unserved = self.pending.take().is_some();
        outcome??;
        if unserved {
            return Err(Error::scope(format!(
                "The scope never requested the script for {file_name}"
            )));
        }
        Ok(())
    }

    /// Resource loader entry point: serve and clear the pending script.
    pub fn fetch_external_resource(&self, request: &ResourceRequest, callback: ResourceCallback) {
        self.pending.serve(request, callback);
    }

    /// Run `callback` with the scope's real timer functions in place.
    pub fn run_with_real_timers<F, R>(&self, callback: F) -> Result<R>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R,
    {
        let live = self.live()?;
        live.scope.with(|ctx| {
            live.fake_timers
                .run_with_real_timers(&ctx, |ctx| callback(ctx.clone()))
        })?
    }

    /// Run `f` inside the scope's context.
    pub fn with_scope<F, R>(&self, f: F) -> Result<R>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R,
    {
        self.live()?.scope.with(f)
    }

    /// Read a global as JSON.
    pub fn global_json(&self, name: &str) -> Result<serde_json::Value> {
        self.with_scope(|ctx| -> Result<serde_json::Value> {
            let value: Value<'_> = ctx.globals().get(name)?;
            Ok(js_to_json(&ctx, value)?)
        })?
    }

    /// Evaluate an expression in the scope and return its value as JSON.
    pub fn eval_json(&self, expression: &str) -> Result<serde_json::Value> {
        self.with_scope(|ctx| -> Result<serde_json::Value> {
            let mut options = EvalOptions::default();
            options.strict = false;
            options.filename = Some(EVAL_FILE.to_string());
            let value: Value<'_> = ctx
                .eval_with_options(expression, options)
                .map_err(|err| caught_to_error(&ctx, err, EVAL_FILE))?;
            Ok(js_to_json(&ctx, value)?)
        })?
    }

    /// Drain promise jobs. Must not be called from inside [`Self::with_scope`].
    pub fn run_microtasks(&self) -> Result<usize> {
        self.live()?;
        self.host.run_microtasks()
    }

    /// Fire the scope's wall-clock timers that are due. Source can only
    /// schedule those from inside [`Self::run_with_real_timers`].
    pub fn run_due_real_timers(&self) -> Result<usize> {
        self.live()?.scope.run_due_timers()
    }

    pub fn reported_errors(&self) -> Result<Vec<String>> {
        Ok(self.live()?.scope.reported_errors())
    }

    pub fn on_close(&mut self, hook: impl FnOnce() + 'static) -> Result<()> {
        let live = self.live.as_mut().ok_or(Error::Disposed)?;
        live.scope.on_close(hook);
        Ok(())
    }

    pub fn run_all_timers(&self) -> Result<usize> {
        let live = self.live()?;
        live.scope.with(|ctx| live.fake_timers.run_all_timers(&ctx))?
    }

    pub fn run_only_pending_timers(&self) -> Result<usize> {
        let live = self.live()?;
        live.scope
            .with(|ctx| live.fake_timers.run_only_pending_timers(&ctx))?
    }

    pub fn run_all_immediates(&self) -> Result<usize> {
        let live = self.live()?;
        live.scope
            .with(|ctx| live.fake_timers.run_all_immediates(&ctx))?
    }

    pub fn advance_timers_by_time(&self, ms: u64) -> Result<usize> {
        let live = self.live()?;
        live.scope
            .with(|ctx| live.fake_timers.advance_timers_by_time(&ctx, ms))?
    }

    pub fn clear_all_timers(&self) -> Result<()> {
        let live = self.live()?;
        live.scope.with(|ctx| live.fake_timers.clear_all_timers(&ctx))?
    }

    pub fn timer_count(&self) -> Result<usize> {
        Ok(self.live()?.fake_timers.timer_count())
    }

    /// The fake clock, in milliseconds since the environment was created.
    pub fn now(&self) -> Result<u64> {
        Ok(self.live()?.fake_timers.now())
    }

    /// Close the scope and drop the fake timers. Later calls do nothing.
    pub fn dispose(&mut self) {
        let Some(Live {
            fake_timers,
            mut scope,
        }) = self.live.take()
        else {
            return;
        };
        if let Err(err) = scope
            .with(|ctx| fake_timers.clear_all_timers(&ctx))
            .and_then(|cleared| cleared)
        {
            tracing::warn!(event = "env.dispose", error = %err, "Failed to clear fake timers");
        }
        self.drain_jobs();
        drop(fake_timers);
        scope.close();
        self.pending.take();
        tracing::debug!(event = "env.dispose", test_url = %self.config.test_url, "Disposed test environment");
    }

    /// Settle the runtime's promise jobs while this scope still exists, so
    /// none of them runs later under another environment's drain. A failing
    /// job only consumes itself; keep going until the queue is empty.
    fn drain_jobs(&self) {
        loop {
            match self.host.run_microtasks() {
                Ok(ran) => {
                    if ran > 0 {
                        tracing::debug!(event = "env.dispose.jobs", ran, "Drained pending jobs");
                    }
                    return;
                }
                Err(err) => {
                    tracing::warn!(event = "env.dispose.jobs", error = %err, "Pending job failed during dispose");
                }
            }
        }
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn eval_script(ctx: &Ctx<'_>, source_text: &str, file_name: &str) -> Result<()> {
    let mut options = EvalOptions::default();
    options.strict = false;
    options.filename = Some(file_name.to_string());
    ctx.eval_with_options::<(), _>(source_text, options)
        .map_err(|err| caught_to_error(ctx, err, file_name))
}

/// Install the default `mockSetReadOnlyProperty` helper unless the global
/// already has one of its own.
fn install_mock_set_read_only_property(ctx: &Ctx<'_>) -> Result<()> {
    let install: Function<'_> = ctx.eval(MOCK_SET_READ_ONLY_PROPERTY_JS)?;
    install
        .call::<_, ()>((ctx.globals(),))
        .map_err(|err| caught_to_error(ctx, err, "<environment>"))
}

const MOCK_SET_READ_ONLY_PROPERTY_JS: &str = r#"
(function (global) {
  'use strict';
  if (Object.prototype.hasOwnProperty.call(global, 'mockSetReadOnlyProperty')) return;
  global.mockSetReadOnlyProperty = function mockSetReadOnlyProperty(obj, property, value) {
    Object.defineProperty(obj, property, {
      get() { return value; },
      configurable: true,
      enumerable: true,
    });
  };
})
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ResourceKind;

    fn request(url: &str) -> ResourceRequest {
        ResourceRequest {
            url: url::Url::parse(url).expect("url"),
            kind: ResourceKind::Script,
        }
    }

    #[test]
    fn pending_script_is_one_shot() {
        let pending = PendingScript::new();
        pending.offer("a.js", "1".to_string()).expect("offer");
        assert!(matches!(
            pending.offer("b.js", "2".to_string()),
            Err(Error::PendingScriptBusy { pending: first }) if first == "a.js"
        ));
        assert_eq!(pending.take().as_deref(), Some("1"));
        assert!(pending.is_empty());
        assert_eq!(pending.take(), None);
    }

    #[test]
    fn serve_answers_exactly_once_and_clears() {
        let pending = PendingScript::new();
        pending.offer("a.js", "window.a = 1;".to_string()).expect("offer");

        let answers: Rc<RefCell<Vec<Result<String>>>> = Rc::default();
        let sink = Rc::clone(&answers);
        pending.serve(&request("http://x/a.js"), Box::new(move |result| sink.borrow_mut().push(result)));
        let sink = Rc::clone(&answers);
        pending.serve(&request("http://x/a.js"), Box::new(move |result| sink.borrow_mut().push(result)));

        let answers = answers.borrow();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].as_ref().expect("served"), "window.a = 1;");
        assert_eq!(
            answers[1].as_ref().expect_err("empty").to_string(),
            "Unable to find source for http://x/a.js"
        );
    }

    #[test]
    fn existing_mock_helper_is_kept() {
        let runtime = rquickjs::Runtime::new().expect("runtime");
        let context = rquickjs::Context::full(&runtime).expect("context");
        context.with(|ctx| {
            ctx.eval::<(), _>("globalThis.mockSetReadOnlyProperty = 'mine';")
                .expect("eval");
            install_mock_set_read_only_property(&ctx).expect("install");
            let kept: String = ctx.eval("mockSetReadOnlyProperty").expect("kept");
            assert_eq!(kept, "mine");
        });
    }

    #[test]
    fn default_mock_helper_defines_a_getter() {
        let runtime = rquickjs::Runtime::new().expect("runtime");
        let context = rquickjs::Context::full(&runtime).expect("context");
        context.with(|ctx| {
            install_mock_set_read_only_property(&ctx).expect("install");
            let ok: bool = ctx
                .eval(
                    "const target = {}; \
                     mockSetReadOnlyProperty(target, 'answer', 42); \
                     target.answer === 42 \
                       && typeof Object.getOwnPropertyDescriptor(target, 'answer').get === 'function'",
                )
                .expect("eval");
            assert!(ok);
        });
    }
}
