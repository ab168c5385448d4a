//! JS-facing timer functions bound to a Rust [`TimerQueue`].
//!
//! Callbacks stay on the JS side (in a `Map` owned by the bridge closure) so
//! the engine's GC can see them; the queue only ever holds timer ids. The same
//! bridge backs the host's `setImmediate`, a scope's real timers and the fake
//! timers.

use crate::scheduler::{DueTimer, TimerKind, TimerQueue};
use rquickjs::function::Func;
use rquickjs::{Ctx, Function, Object, Persistent};
use std::cell::RefCell;
use std::rc::Rc;

pub const TIMER_FUNCTIONS: [&str; 4] = ["setTimeout", "clearTimeout", "setInterval", "clearInterval"];
pub const IMMEDIATE_FUNCTIONS: [&str; 2] = ["setImmediate", "clearImmediate"];

const KIND_TIMEOUT: i32 = 0;
const KIND_INTERVAL: i32 = 1;
const KIND_IMMEDIATE: i32 = 2;

pub struct TimerBridge {
    functions: Persistent<Object<'static>>,
    queue: Rc<RefCell<TimerQueue>>,
}

impl std::fmt::Debug for TimerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerBridge")
            .field("pending", &self.queue.borrow().len())
            .finish_non_exhaustive()
    }
}

impl TimerBridge {
    pub fn new(ctx: &Ctx<'_>, queue: Rc<RefCell<TimerQueue>>) -> rquickjs::Result<Self> {
        let schedule_queue = Rc::clone(&queue);
        let schedule = Func::from(move |kind: i32, delay_ms: f64| -> f64 {
            let mut queue = schedule_queue.borrow_mut();
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let delay_ms = if delay_ms.is_finite() && delay_ms > 0.0 {
                delay_ms as u64
            } else {
                0
            };
            let id = match kind {
                KIND_INTERVAL => queue.schedule(
                    TimerKind::Interval {
                        period_ms: delay_ms,
                    },
                    delay_ms,
                ),
                KIND_IMMEDIATE => queue.schedule_immediate(),
                _ => queue.schedule(TimerKind::Timeout, delay_ms),
            };
            #[allow(clippy::cast_precision_loss)]
            let id = id as f64;
            id
        });
        let cancel_queue = Rc::clone(&queue);
        let cancel = Func::from(move |timer_id: f64| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            cancel_queue.borrow_mut().cancel(timer_id as u64);
        });

        let factory: Function<'_> = ctx.eval(TIMER_BRIDGE_JS)?;
        let functions: Object<'_> =
            factory.call((schedule, cancel, KIND_TIMEOUT, KIND_INTERVAL, KIND_IMMEDIATE))?;
        Ok(Self {
            functions: Persistent::save(ctx, functions),
            queue,
        })
    }

    pub fn queue(&self) -> &Rc<RefCell<TimerQueue>> {
        &self.queue
    }

    /// The bridge object holding `setTimeout`, `fire`, ... for this context.
    pub fn functions<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        self.functions.clone().restore(ctx)
    }

    /// Copy the named functions onto `target`.
    pub fn install<'js>(
        &self,
        ctx: &Ctx<'js>,
        target: &Object<'js>,
        names: &[&str],
    ) -> rquickjs::Result<()> {
        let functions = self.functions(ctx)?;
        for name in names {
            let function: Function<'js> = functions.get(*name)?;
            target.set(*name, function)?;
        }
        Ok(())
    }

    /// Run the callback of a due timer. Intervals are re-armed before the
    /// callback runs so that clearing them from inside the callback sticks.
    pub fn fire_timer(&self, ctx: &Ctx<'_>, due: &DueTimer) -> rquickjs::Result<bool> {
        if due.is_interval() {
            self.queue.borrow_mut().reschedule_interval(due);
        }
        self.fire(ctx, due.timer_id, due.is_interval())
    }

    pub fn fire_immediate(&self, ctx: &Ctx<'_>, timer_id: u64) -> rquickjs::Result<bool> {
        self.fire(ctx, timer_id, false)
    }

    /// Drop every pending timer and its callback.
    pub fn clear_all(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        self.queue.borrow_mut().clear();
        let clear: Function<'_> = self.functions(ctx)?.get("clearAll")?;
        clear.call::<_, ()>(())
    }

    fn fire(&self, ctx: &Ctx<'_>, timer_id: u64, keep: bool) -> rquickjs::Result<bool> {
        let fire: Function<'_> = self.functions(ctx)?.get("fire")?;
        #[allow(clippy::cast_precision_loss)]
        let id = timer_id as f64;
        tracing::trace!(event = "timers.fire", timer_id, keep, "Firing timer callback");
        fire.call((id, keep))
    }
}

const TIMER_BRIDGE_JS: &str = r#"
(function (schedule, cancel, TIMEOUT, INTERVAL, IMMEDIATE) {
  'use strict';
  const callbacks = new Map();

  function toCallback(callback, name) {
    if (typeof callback === 'function') return callback;
    if (typeof callback === 'string') {
      const source = callback;
      return function () { (0, eval)(source); };
    }
    throw new TypeError(name + ': the callback must be a function');
  }

  function register(kind, name, callback, delay, args) {
    const fn = toCallback(callback, name);
    const id = schedule(kind, Number(delay));
    callbacks.set(id, { fn, args });
    return id;
  }

  function clear(id) {
    if (callbacks.delete(id)) cancel(id);
  }

  return {
    setTimeout: function setTimeout(callback, delay, ...args) {
      return register(TIMEOUT, 'setTimeout', callback, delay, args);
    },
    clearTimeout: function clearTimeout(id) { clear(id); },
    setInterval: function setInterval(callback, delay, ...args) {
      return register(INTERVAL, 'setInterval', callback, delay, args);
    },
    clearInterval: function clearInterval(id) { clear(id); },
    setImmediate: function setImmediate(callback, ...args) {
      return register(IMMEDIATE, 'setImmediate', callback, 0, args);
    },
    clearImmediate: function clearImmediate(id) { clear(id); },
    fire(id, keep) {
      const entry = callbacks.get(id);
      if (entry === undefined) return false;
      if (!keep) callbacks.delete(id);
      entry.fn.apply(undefined, entry.args);
      return true;
    },
    clearAll() { callbacks.clear(); },
  };
})
"#;
