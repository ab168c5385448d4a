//! Controllable replacements for a scope's timer functions.
//!
//! [`FakeTimers::install`] snapshots the scope's real `setTimeout` family,
//! then installs bridge functions whose queue runs on a [`ManualClock`].
//! Nothing fires until one of the `run_*`/`advance_*` methods is called.

use crate::convert::caught_to_error;
use crate::error::{Error, Result};
use crate::scheduler::{Clock as _, ClockHandle, DueTimer, ManualClock, TimerIds, TimerQueue};
use crate::timer_bridge::{IMMEDIATE_FUNCTIONS, TIMER_FUNCTIONS, TimerBridge};
use rquickjs::{Ctx, Object, Persistent, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

pub const DEFAULT_MAX_LOOPS: usize = 100_000;

const TIMER_FILE: &str = "<timer>";

fn faked_names() -> impl Iterator<Item = &'static str> {
    TIMER_FUNCTIONS.into_iter().chain(IMMEDIATE_FUNCTIONS)
}

fn runaway(count: usize, what: &str) -> Error {
    Error::timers(format!(
        "Ran {count} {what}, and there are still more! Assuming we've hit an infinite recursion and bailing out..."
    ))
}

pub struct FakeTimers {
    bridge: TimerBridge,
    originals: Persistent<Object<'static>>,
    clock: Arc<ManualClock>,
    max_loops: usize,
    faked: Cell<bool>,
}

impl std::fmt::Debug for FakeTimers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTimers")
            .field("now_ms", &self.now())
            .field("pending", &self.timer_count())
            .field("faked", &self.faked.get())
            .finish_non_exhaustive()
    }
}

impl FakeTimers {
    /// Capture the real timer functions of `ctx`'s global and put fakes in
    /// their place.
    pub fn install(ctx: &Ctx<'_>, max_loops: usize) -> Result<Self> {
        Self::install_with_ids(ctx, max_loops, TimerIds::new())
    }

    /// Like [`Self::install`], drawing timer ids from `ids` so they never
    /// collide with the real timers sharing it.
    pub fn install_with_ids(ctx: &Ctx<'_>, max_loops: usize, ids: TimerIds) -> Result<Self> {
        if max_loops == 0 {
            return Err(Error::timers("max_loops must be greater than zero"));
        }
        let globals = ctx.globals();
        let originals = Object::new(ctx.clone())?;
        for name in faked_names() {
            let value: Value<'_> = globals.get(name)?;
            if value.is_function() {
                originals.set(name, value)?;
            }
        }

        let clock = Arc::new(ManualClock::new(0));
        let queue = TimerQueue::with_ids(ClockHandle::new(Arc::clone(&clock) as _), ids);
        let bridge = TimerBridge::new(ctx, Rc::new(RefCell::new(queue)))
            .map_err(|err| Error::timers(format!("Failed to create fake timer functions: {err}")))?;

        let timers = Self {
            bridge,
            originals: Persistent::save(ctx, originals),
            clock,
            max_loops,
            faked: Cell::new(false),
        };
        timers.use_fake_timers(ctx)?;
        tracing::debug!(event = "timers.install", max_loops, "Installed fake timers");
        Ok(timers)
    }

    pub fn is_faked(&self) -> bool {
        self.faked.get()
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Pending timers and immediates.
    pub fn timer_count(&self) -> usize {
        self.bridge.queue().borrow().len()
    }

    pub fn use_fake_timers(&self, ctx: &Ctx<'_>) -> Result<()> {
        let names: Vec<&str> = faked_names().collect();
        self.bridge.install(ctx, &ctx.globals(), &names)?;
        self.faked.set(true);
        Ok(())
    }

    pub fn use_real_timers(&self, ctx: &Ctx<'_>) -> Result<()> {
        let globals = ctx.globals();
        let originals = self.originals.clone().restore(ctx)?;
        for name in faked_names() {
            if originals.contains_key(name)? {
                let original: Value<'_> = originals.get(name)?;
                globals.set(name, original)?;
            } else {
                globals.remove(name)?;
            }
        }
        self.faked.set(false);
        Ok(())
    }

    /// Run `callback` with the real timer functions on the global. The fakes
    /// come back however the callback exits, including by panicking.
    pub fn run_with_real_timers<'js, R>(
        &self,
        ctx: &Ctx<'js>,
        callback: impl FnOnce(&Ctx<'js>) -> R,
    ) -> Result<R> {
        // Armed before the swap so a half-finished swap is undone too.
        let _restore = RestoreGuard {
            timers: self,
            ctx,
            refake: self.is_faked(),
        };
        self.use_real_timers(ctx)?;
        Ok(callback(ctx))
    }

    /// Run every queued immediate, including ones queued along the way.
    pub fn run_all_immediates(&self, ctx: &Ctx<'_>) -> Result<usize> {
        for ran in 0..self.max_loops {
            let next = self.bridge.queue().borrow_mut().pop_immediate();
            let Some(timer_id) = next else {
                return Ok(ran);
            };
            self.bridge
                .fire_immediate(ctx, timer_id)
                .map_err(|err| caught_to_error(ctx, err, TIMER_FILE))?;
        }
        if self.bridge.queue().borrow().has_immediates() {
            return Err(runaway(self.max_loops, "immediates"));
        }
        Ok(self.max_loops)
    }

    /// Drain immediates, then fire timers in deadline order until none are
    /// left, moving the clock forward to each deadline.
    pub fn run_all_timers(&self, ctx: &Ctx<'_>) -> Result<usize> {
        let mut ran = self.run_all_immediates(ctx)?;
        for _ in 0..self.max_loops {
            let next = self.bridge.queue().borrow_mut().pop_due_at(u64::MAX);
            let Some(due) = next else {
                return Ok(ran);
            };
            self.fire(ctx, &due)?;
            ran += 1;
        }
        if self.bridge.queue().borrow().next_deadline().is_some() {
            return Err(runaway(self.max_loops, "timers"));
        }
        Ok(ran)
    }

    /// Fire only what is pending right now; anything those callbacks
    /// schedule stays queued.
    pub fn run_only_pending_timers(&self, ctx: &Ctx<'_>) -> Result<usize> {
        let (immediates, pending) = {
            let mut queue = self.bridge.queue().borrow_mut();
            let immediates: Vec<u64> = std::iter::from_fn(|| queue.pop_immediate()).collect();
            (immediates, queue.pending_ids())
        };

        let mut ran = 0;
        for timer_id in immediates {
            self.bridge
                .fire_immediate(ctx, timer_id)
                .map_err(|err| caught_to_error(ctx, err, TIMER_FILE))?;
            ran += 1;
        }
        for timer_id in pending {
            let taken = self.bridge.queue().borrow_mut().take(timer_id);
            if let Some(due) = taken {
                self.fire(ctx, &due)?;
                ran += 1;
            }
        }
        Ok(ran)
    }

    /// Move the clock forward by `ms`, firing every timer that comes due on
    /// the way, in order.
    pub fn advance_timers_by_time(&self, ctx: &Ctx<'_>, ms: u64) -> Result<usize> {
        let target = self.now().saturating_add(ms);
        for ran in 0..self.max_loops {
            let next = self.bridge.queue().borrow_mut().pop_due_at(target);
            let Some(due) = next else {
                self.clock.set(target);
                return Ok(ran);
            };
            self.fire(ctx, &due)?;
        }
        let more = self
            .bridge
            .queue()
            .borrow()
            .next_deadline()
            .is_some_and(|deadline| deadline <= target);
        if more {
            return Err(runaway(self.max_loops, "timers"));
        }
        self.clock.set(target);
        Ok(self.max_loops)
    }

    pub fn clear_all_timers(&self, ctx: &Ctx<'_>) -> Result<()> {
        self.bridge.clear_all(ctx)?;
        Ok(())
    }

    fn fire(&self, ctx: &Ctx<'_>, due: &DueTimer) -> Result<()> {
        if due.deadline_ms > self.now() {
            self.clock.set(due.deadline_ms);
        }
        self.bridge
            .fire_timer(ctx, due)
            .map_err(|err| caught_to_error(ctx, err, TIMER_FILE))?;
        Ok(())
    }
}

struct RestoreGuard<'a, 'js> {
    timers: &'a FakeTimers,
    ctx: &'a Ctx<'js>,
    refake: bool,
}

impl Drop for RestoreGuard<'_, '_> {
    fn drop(&mut self) {
        if !self.refake {
            return;
        }
        if let Err(err) = self.timers.use_fake_timers(self.ctx) {
            tracing::warn!(event = "timers.restore", error = %err, "Failed to reinstall fake timers");
        }
    }
}
