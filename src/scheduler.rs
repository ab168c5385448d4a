//! Deterministic timer queue shared by real and fake timer implementations.
//!
//! Timers are ordered by `(deadline_ms, order_seq, timer_id)`, so two timers due
//! at the same instant fire in the order they were scheduled. Immediates live in
//! their own FIFO and never consult the clock.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock {
    fn now_ms(&self) -> u64;
}

#[derive(Clone)]
pub struct ClockHandle(Arc<dyn Clock + Send + Sync>);

impl ClockHandle {
    pub fn new(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self(clock)
    }
}

impl Clock for ClockHandle {
    fn now_ms(&self) -> u64 {
        self.0.now_ms()
    }
}

impl std::fmt::Debug for ClockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClockHandle").field(&self.now_ms()).finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub const fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(AtomicOrdering::SeqCst)
    }
}

/// Source of timer ids. Queues sharing one never hand out the same id, so an
/// id from one queue can't cancel a timer in another.
#[derive(Debug, Clone)]
pub struct TimerIds(Arc<AtomicU64>);

impl TimerIds {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, AtomicOrdering::Relaxed)
    }
}

impl Default for TimerIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Timeout,
    Interval { period_ms: u64 },
}

/// A timer whose deadline has passed and that should fire now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueTimer {
    pub timer_id: u64,
    pub deadline_ms: u64,
    pub kind: TimerKind,
}

impl DueTimer {
    pub const fn is_interval(&self) -> bool {
        matches!(self.kind, TimerKind::Interval { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
    deadline_ms: u64,
    order_seq: u64,
    timer_id: u64,
    kind: TimerKind,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline_ms, self.order_seq, self.timer_id).cmp(&(
            other.deadline_ms,
            other.order_seq,
            other.timer_id,
        ))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct TimerQueue {
    clock: ClockHandle,
    seq: u64,
    ids: TimerIds,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    cancelled_timers: HashSet<u64>,
    intervals: HashMap<u64, u64>,
    immediates: VecDeque<u64>,
}

impl TimerQueue {
    pub fn new(clock: ClockHandle) -> Self {
        Self::with_ids(clock, TimerIds::new())
    }

    /// A queue drawing its ids from `ids`.
    pub fn with_ids(clock: ClockHandle, ids: TimerIds) -> Self {
        Self {
            clock,
            seq: 0,
            ids,
            timers: BinaryHeap::new(),
            cancelled_timers: HashSet::new(),
            intervals: HashMap::new(),
            immediates: VecDeque::new(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn schedule(&mut self, kind: TimerKind, delay_ms: u64) -> u64 {
        let timer_id = self.next_id();
        if let TimerKind::Interval { period_ms } = kind {
            self.intervals.insert(timer_id, period_ms);
        }
        let deadline_ms = self.clock.now_ms().saturating_add(delay_ms);
        self.push(timer_id, deadline_ms, kind);
        tracing::trace!(
            event = "scheduler.schedule",
            timer_id,
            deadline_ms,
            "Scheduled timer"
        );
        timer_id
    }

    pub fn schedule_immediate(&mut self) -> u64 {
        let timer_id = self.next_id();
        self.immediates.push_back(timer_id);
        timer_id
    }

    /// Cancel a timer or immediate. Returns false for unknown or already-fired ids.
    pub fn cancel(&mut self, timer_id: u64) -> bool {
        if let Some(pos) = self.immediates.iter().position(|id| *id == timer_id) {
            self.immediates.remove(pos);
            return true;
        }
        let pending = self
            .timers
            .iter()
            .any(|Reverse(entry)| entry.timer_id == timer_id);
        self.intervals.remove(&timer_id);
        if pending {
            self.cancelled_timers.insert(timer_id)
        } else {
            false
        }
    }

    /// Pop the earliest timer due at or before the current clock reading.
    pub fn pop_due(&mut self) -> Option<DueTimer> {
        let now = self.clock.now_ms();
        self.pop_due_at(now)
    }

    /// Pop the earliest timer due at or before `limit_ms`, regardless of the clock.
    pub fn pop_due_at(&mut self, limit_ms: u64) -> Option<DueTimer> {
        while let Some(Reverse(entry)) = self.timers.peek().cloned() {
            if entry.deadline_ms > limit_ms {
                return None;
            }
            let _ = self.timers.pop();
            if self.cancelled_timers.remove(&entry.timer_id) {
                continue;
            }
            return Some(DueTimer {
                timer_id: entry.timer_id,
                deadline_ms: entry.deadline_ms,
                kind: entry.kind,
            });
        }
        None
    }

    /// Remove a specific pending timer so it can be fired out of band.
    pub fn take(&mut self, timer_id: u64) -> Option<DueTimer> {
        if self.cancelled_timers.contains(&timer_id) {
            return None;
        }
        let mut entries = std::mem::take(&mut self.timers).into_vec();
        let taken = entries
            .iter()
            .position(|Reverse(entry)| entry.timer_id == timer_id)
            .map(|index| entries.swap_remove(index).0);
        self.timers = BinaryHeap::from(entries);
        taken.map(|entry| DueTimer {
            timer_id: entry.timer_id,
            deadline_ms: entry.deadline_ms,
            kind: entry.kind,
        })
    }

    pub fn pop_immediate(&mut self) -> Option<u64> {
        self.immediates.pop_front()
    }

    /// Re-arm an interval after it fired. No-op if it was cleared in the meantime.
    pub fn reschedule_interval(&mut self, due: &DueTimer) -> bool {
        let Some(period_ms) = self.intervals.get(&due.timer_id).copied() else {
            return false;
        };
        let deadline_ms = due.deadline_ms.saturating_add(period_ms.max(1));
        self.push(due.timer_id, deadline_ms, due.kind);
        true
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers
            .iter()
            .filter(|Reverse(entry)| !self.cancelled_timers.contains(&entry.timer_id))
            .map(|Reverse(entry)| entry.deadline_ms)
            .min()
    }

    /// Ids of live timers in firing order.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut entries: Vec<&TimerEntry> = self
            .timers
            .iter()
            .map(|Reverse(entry)| entry)
            .filter(|entry| !self.cancelled_timers.contains(&entry.timer_id))
            .collect();
        entries.sort();
        entries.into_iter().map(|entry| entry.timer_id).collect()
    }

    pub fn len(&self) -> usize {
        self.timers.len() - self.cancelled_timers.len() + self.immediates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_immediates(&self) -> bool {
        !self.immediates.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
        self.cancelled_timers.clear();
        self.intervals.clear();
        self.immediates.clear();
    }

    fn push(&mut self, timer_id: u64, deadline_ms: u64, kind: TimerKind) {
        let order_seq = self.next_seq();
        self.timers.push(Reverse(TimerEntry {
            deadline_ms,
            order_seq,
            timer_id,
            kind,
        }));
    }

    fn next_id(&self) -> u64 {
        self.ids.next()
    }

    const fn next_seq(&mut self) -> u64 {
        let current = self.seq;
        self.seq = self.seq.saturating_add(1);
        current
    }
}
