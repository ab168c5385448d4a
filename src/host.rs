//! The process-level host: one QuickJS runtime shared by every scope.
//!
//! A [`Host`] owns the runtime plus a private context in which the
//! process-level globals (`Buffer`, `process`, optionally `setImmediate`) are
//! created once. Scopes receive those values by reference, exactly as a test
//! runner would forward its own process objects into each test's sandbox.

use crate::buffer_shim::create_buffer_constructor;
use crate::convert::caught_to_error;
use crate::error::{Error, Result};
use crate::scheduler::{ClockHandle, SystemClock, TimerIds, TimerQueue};
use crate::scope::{ResourceLoader, Scope, ScopeFeatures};
use crate::timer_bridge::TimerBridge;
use rquickjs::function::Func;
use rquickjs::{Context, Ctx, Function, Object, Persistent, Runtime};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

const IMMEDIATE_FILE: &str = "<immediate>";
const MICROTASK_FILE: &str = "<microtask>";

/// Options for building a [`Host`].
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Expose `setImmediate`/`clearImmediate` to scopes.
    pub immediates: bool,
    /// `process.argv`
    pub argv: Vec<String>,
    /// `process.env`
    pub env: BTreeMap<String, String>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            immediates: true,
            argv: std::env::args().collect(),
            env: std::env::vars().collect(),
        }
    }
}

impl HostOptions {
    /// Options that do not leak the current process's arguments or environment.
    pub fn isolated() -> Self {
        Self {
            immediates: true,
            argv: vec!["pijs-env".to_string()],
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn without_immediates(mut self) -> Self {
        self.immediates = false;
        self
    }
}

/// Handles to the values forwarded into every scope.
struct HostCapabilities {
    buffer: Persistent<Function<'static>>,
    process: Persistent<Object<'static>>,
    immediates: Option<TimerBridge>,
}

pub struct Host {
    // Persistent handles must go before the runtime.
    capabilities: HostCapabilities,
    timer_ids: TimerIds,
    context: Context,
    runtime: Runtime,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("immediates", &self.capabilities.immediates)
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn new(options: HostOptions) -> Result<Rc<Self>> {
        let runtime = Runtime::new()?;
        let context = Context::full(&runtime)?;
        let timer_ids = TimerIds::new();

        let capabilities = context.with(|ctx| -> Result<HostCapabilities> {
            let buffer = create_buffer_constructor(&ctx)
                .map_err(|err| caught_to_error(&ctx, err, "<buffer>"))?;
            let process = create_process(&ctx, &options)
                .map_err(|err| caught_to_error(&ctx, err, "<process>"))?;
            let immediates = if options.immediates {
                let queue =
                    TimerQueue::with_ids(ClockHandle::new(Arc::new(SystemClock)), timer_ids.clone());
                Some(TimerBridge::new(&ctx, Rc::new(RefCell::new(queue)))?)
            } else {
                None
            };
            Ok(HostCapabilities {
                buffer: Persistent::save(&ctx, buffer),
                process: Persistent::save(&ctx, process),
                immediates,
            })
        })?;

        tracing::debug!(
            event = "host.create",
            immediates = options.immediates,
            "Created JS host"
        );
        Ok(Rc::new(Self {
            capabilities,
            timer_ids,
            context,
            runtime,
        }))
    }

    pub const fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The shared `Buffer` constructor, as seen from `ctx`.
    pub fn buffer<'js>(&self, ctx: &Ctx<'js>) -> Result<Function<'js>> {
        Ok(self.capabilities.buffer.clone().restore(ctx)?)
    }

    /// The shared `process` object, as seen from `ctx`.
    pub fn process<'js>(&self, ctx: &Ctx<'js>) -> Result<Object<'js>> {
        Ok(self.capabilities.process.clone().restore(ctx)?)
    }

    /// Id source shared by every timer queue on this host.
    pub fn timer_ids(&self) -> TimerIds {
        self.timer_ids.clone()
    }

    pub const fn has_immediates(&self) -> bool {
        self.capabilities.immediates.is_some()
    }

    /// `setImmediate` and `clearImmediate`, if this host provides them.
    pub fn immediates<'js>(&self, ctx: &Ctx<'js>) -> Result<Option<(Function<'js>, Function<'js>)>> {
        let Some(bridge) = &self.capabilities.immediates else {
            return Ok(None);
        };
        let functions = bridge.functions(ctx)?;
        Ok(Some((
            functions.get("setImmediate")?,
            functions.get("clearImmediate")?,
        )))
    }

    /// Run the immediates queued so far. Immediates queued by those callbacks
    /// wait for the next call.
    pub fn run_immediates(&self) -> Result<usize> {
        let Some(bridge) = &self.capabilities.immediates else {
            return Ok(0);
        };
        let queued: Vec<u64> = {
            let mut queue = bridge.queue().borrow_mut();
            std::iter::from_fn(|| queue.pop_immediate()).collect()
        };
        self.context.with(|ctx| {
            let mut ran = 0;
            for timer_id in queued {
                if bridge
                    .fire_immediate(&ctx, timer_id)
                    .map_err(|err| caught_to_error(&ctx, err, IMMEDIATE_FILE))?
                {
                    ran += 1;
                }
            }
            Ok(ran)
        })
    }

    /// Drain the QuickJS job queue (promise reactions, `process.nextTick`).
    ///
    /// Must not be called while any context of this runtime is in use.
    pub fn run_microtasks(&self) -> Result<usize> {
        let mut ran = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => return Ok(ran),
                Err(job) => {
                    return Err(job.0.with(|ctx| {
                        caught_to_error(&ctx, rquickjs::Error::Exception, MICROTASK_FILE)
                    }));
                }
            }
        }
    }

    /// Create a fresh browser-like scope addressed as `url`.
    pub fn create_scope(
        self: &Rc<Self>,
        url: &str,
        loader: ResourceLoader,
        features: ScopeFeatures,
    ) -> Result<Scope> {
        let url = url::Url::parse(url)
            .map_err(|err| Error::scope(format!("Invalid scope URL {url:?}: {err}")))?;
        Scope::new(Rc::clone(self), url, loader, features)
    }
}

fn node_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

fn node_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    }
}

fn create_process<'js>(ctx: &Ctx<'js>, options: &HostOptions) -> rquickjs::Result<Object<'js>> {
    let env = Object::new(ctx.clone())?;
    for (key, value) in &options.env {
        env.set(key.as_str(), value.as_str())?;
    }
    let versions = Object::new(ctx.clone())?;
    versions.set("pijs", env!("CARGO_PKG_VERSION"))?;

    let started = Instant::now();
    let init = Object::new(ctx.clone())?;
    init.set("argv", options.argv.clone())?;
    init.set("env", env)?;
    init.set("platform", node_platform())?;
    init.set("arch", node_arch())?;
    init.set("pid", std::process::id())?;
    init.set("version", concat!("v", env!("CARGO_PKG_VERSION")))?;
    init.set("versions", versions)?;
    init.set(
        "cwd",
        Func::from(|| -> String {
            std::env::current_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_default()
        }),
    )?;
    init.set(
        "hrtime",
        Func::from(move || -> Vec<f64> {
            let elapsed = started.elapsed();
            #[allow(clippy::cast_precision_loss)]
            let secs = elapsed.as_secs() as f64;
            vec![secs, f64::from(elapsed.subsec_nanos())]
        }),
    )?;

    let factory: Function<'js> = ctx.eval(PROCESS_JS)?;
    factory.call((init,))
}

const PROCESS_JS: &str = r#"
(function (init) {
  'use strict';
  const listeners = new Map();

  function hrtime(previous) {
    const now = init.hrtime();
    if (!Array.isArray(previous)) return now;
    let secs = now[0] - previous[0];
    let nanos = now[1] - previous[1];
    if (nanos < 0) { secs -= 1; nanos += 1e9; }
    return [secs, nanos];
  }
  hrtime.bigint = function () {
    const [secs, nanos] = init.hrtime();
    return BigInt(secs) * 1000000000n + BigInt(nanos);
  };

  const process = {
    title: 'pijs',
    argv: init.argv,
    env: init.env,
    platform: init.platform,
    arch: init.arch,
    pid: init.pid,
    version: init.version,
    versions: init.versions,
    exitCode: undefined,
    cwd() { return init.cwd(); },
    hrtime,
    nextTick(callback, ...args) {
      if (typeof callback !== 'function') {
        throw new TypeError('The "callback" argument must be of type function');
      }
      Promise.resolve().then(() => callback(...args));
    },
    on(event, listener) {
      if (!listeners.has(event)) listeners.set(event, []);
      listeners.get(event).push(listener);
      return process;
    },
    off(event, listener) {
      const list = listeners.get(event);
      if (list) {
        const index = list.indexOf(listener);
        if (index !== -1) list.splice(index, 1);
      }
      return process;
    },
    emit(event, ...args) {
      const list = listeners.get(event);
      if (!list || list.length === 0) return false;
      for (const listener of list.slice()) listener.apply(process, args);
      return true;
    },
  };
  process.addListener = process.on;
  process.removeListener = process.off;
  return process;
})
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_env() -> HostOptions {
        let mut options = HostOptions::isolated();
        options.argv = vec!["node".to_string(), "test.js".to_string()];
        options.env.insert("PIJS_MODE".to_string(), "test".to_string());
        options
    }

    #[test]
    fn process_reflects_options() {
        let host = Host::new(options_with_env()).expect("host");
        host.context.with(|ctx| {
            let process = host.process(&ctx).expect("process");
            ctx.globals().set("process", process).expect("set");
            let argv: Vec<String> = ctx.eval("process.argv").expect("argv");
            assert_eq!(argv, vec!["node", "test.js"]);
            let mode: String = ctx.eval("process.env.PIJS_MODE").expect("env");
            assert_eq!(mode, "test");
            let ok: bool = ctx
                .eval("typeof process.cwd() === 'string' && process.hrtime().length === 2")
                .expect("eval");
            assert!(ok);
        });
    }

    #[test]
    fn next_tick_runs_on_microtask_drain() {
        let host = Host::new(HostOptions::isolated()).expect("host");
        host.context.with(|ctx| {
            let process = host.process(&ctx).expect("process");
            ctx.globals().set("process", process).expect("set");
            ctx.eval::<(), _>("globalThis.ticked = 0; process.nextTick((n) => { ticked = n; }, 3);")
                .expect("eval");
        });
        assert!(host.run_microtasks().expect("microtasks") >= 1);
        let ticked: i32 = host.context.with(|ctx| ctx.eval("ticked")).expect("ticked");
        assert_eq!(ticked, 3);
    }

    #[test]
    fn immediates_run_in_fifo_order_and_only_once() {
        let host = Host::new(HostOptions::isolated()).expect("host");
        host.context.with(|ctx| {
            let (set, clear) = host.immediates(&ctx).expect("immediates").expect("present");
            ctx.globals().set("setImmediate", set).expect("set");
            ctx.globals().set("clearImmediate", clear).expect("clear");
            ctx.eval::<(), _>(
                "globalThis.order = []; \
                 setImmediate(() => order.push(1)); \
                 const skip = setImmediate(() => order.push(2)); \
                 setImmediate(() => { order.push(3); setImmediate(() => order.push(4)); }); \
                 clearImmediate(skip);",
            )
            .expect("eval");
        });
        assert_eq!(host.run_immediates().expect("first"), 2);
        assert_eq!(host.run_immediates().expect("second"), 1);
        let order: Vec<i32> = host.context.with(|ctx| ctx.eval("order")).expect("order");
        assert_eq!(order, vec![1, 3, 4]);
    }

    #[test]
    fn immediates_can_be_disabled() {
        let host = Host::new(HostOptions::isolated().without_immediates()).expect("host");
        assert!(!host.has_immediates());
        host.context.with(|ctx| {
            assert!(host.immediates(&ctx).expect("lookup").is_none());
        });
        assert_eq!(host.run_immediates().expect("run"), 0);
    }

    #[test]
    fn rejected_reactions_do_not_fail_the_drain() {
        let host = Host::new(HostOptions::isolated()).expect("host");
        host.context.with(|ctx| {
            ctx.eval::<(), _>(
                "globalThis.caught = ''; \
                 Promise.resolve() \
                   .then(() => { throw new RangeError('late'); }) \
                   .catch((err) => { caught = err.message; });",
            )
            .expect("eval");
        });
        assert!(host.run_microtasks().expect("drain") >= 2);
        let caught: String = host.context.with(|ctx| ctx.eval("caught")).expect("caught");
        assert_eq!(caught, "late");
    }
}
