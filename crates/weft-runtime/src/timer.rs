//! Ordered timer set
//!
//! Deadline-ordered timers over a wall clock, with cancel / refresh / reset,
//! recurring re-insertion, condition (weak-liveness) wrapping and a
//! backward-jump guard: if the wall clock moves back by an hour or more,
//! the next drain treats every timer as expired.
//!
//! Deadlines are absolute milliseconds; ties are broken by insertion
//! sequence. The set is guarded by one reader/writer lock; each timer's
//! mutable fields sit behind their own mutex, always acquired after the set
//! lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Deadline encoding for "never"
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Backward wall-clock jump that invalidates every deadline: one hour
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// Timer callbacks may fire more than once (recurring timers), so they are
/// shared `Fn` closures.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Wall clock in milliseconds since the epoch
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct TimerState {
    interval_ms: u64,
    next_ms: u64,
    recurring: bool,
    /// None once cancelled or fired (non-recurring)
    cb: Option<TimerCallback>,
}

struct TimerShared {
    seq: u64,
    state: Mutex<TimerState>,
}

/// Handle to a scheduled timer; pass it back to the owning manager to
/// cancel, refresh or reset.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    /// True once the callback has been cleared (cancelled, or fired for a
    /// non-recurring timer).
    pub fn is_spent(&self) -> bool {
        self.shared.state.lock().unwrap().cb.is_none()
    }
}

/// The ordered timer set
pub struct TimerManager {
    timers: RwLock<BTreeMap<(u64, u64), Arc<TimerShared>>>,
    /// Set when a head insertion has already been notified; cleared by
    /// `next_timer_ms` so the next head insertion notifies again
    tickled: AtomicBool,
    previous_ms: AtomicU64,
    seq: AtomicU64,
    /// Invoked (outside the lock) when an insertion lands at the head
    wake_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            timers: RwLock::new(BTreeMap::new()),
            tickled: AtomicBool::new(false),
            previous_ms: AtomicU64::new(now_ms()),
            seq: AtomicU64::new(0),
            wake_hook: OnceLock::new(),
        }
    }

    /// Install the earliest-deadline-changed hook. One shot; later calls
    /// are ignored.
    pub fn set_wake_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        let _ = self.wake_hook.set(hook);
    }

    /// Schedule `cb` to run after `ms` milliseconds
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let shared = Arc::new(TimerShared {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TimerState {
                interval_ms: ms,
                next_ms: now_ms() + ms,
                recurring,
                cb: Some(Arc::new(cb)),
            }),
        });
        self.insert(&shared);
        Timer { shared }
    }

    /// Schedule `cb`, but skip it silently if `cond` is no longer upgradable
    /// when the deadline fires. The timer never extends the lifetime of
    /// what it watches.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: 0 if already due,
    /// [`NO_TIMEOUT`] if the set is empty. Clears the head-change-notified
    /// flag.
    pub fn next_timer_ms(&self) -> u64 {
        self.tickled.store(false, Ordering::Relaxed);
        let timers = self.timers.read().unwrap();
        match timers.keys().next() {
            None => NO_TIMEOUT,
            Some(&(next, _)) => {
                let now = now_ms();
                if next <= now {
                    0
                } else {
                    next - now
                }
            }
        }
    }

    /// Whether any timer is scheduled
    pub fn has_timer(&self) -> bool {
        !self.timers.read().unwrap().is_empty()
    }

    /// Pop every expired timer, appending callbacks to `out` in deadline
    /// order. Recurring timers are re-inserted at `now + interval`;
    /// non-recurring ones are spent. A backward clock jump of an hour or
    /// more expires everything.
    pub fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = now_ms();
        let rollover = self.detect_rollover(now);

        let mut timers = self.timers.write().unwrap();
        loop {
            let key = match timers.keys().next() {
                Some(&k) => k,
                None => break,
            };
            if !rollover && key.0 > now {
                break;
            }
            let shared = timers.remove(&key).unwrap();
            let mut state = shared.state.lock().unwrap();
            let cb = match state.cb.clone() {
                Some(cb) => cb,
                None => continue,
            };
            out.push(cb);
            if state.recurring {
                state.next_ms = now + state.interval_ms;
                let new_key = (state.next_ms, shared.seq);
                drop(state);
                timers.insert(new_key, shared);
            } else {
                state.cb = None;
            }
        }
    }

    /// Remove the timer and null its callback. The second call on the same
    /// timer returns false.
    pub fn cancel(&self, timer: &Timer) -> bool {
        let mut timers = self.timers.write().unwrap();
        let mut state = timer.shared.state.lock().unwrap();
        if state.cb.is_none() {
            return false;
        }
        state.cb = None;
        timers.remove(&(state.next_ms, timer.shared.seq));
        true
    }

    /// Push the deadline out to `now + interval`. No-op on a spent timer.
    pub fn refresh(&self, timer: &Timer) -> bool {
        let mut timers = self.timers.write().unwrap();
        let mut state = timer.shared.state.lock().unwrap();
        if state.cb.is_none() {
            return false;
        }
        if timers.remove(&(state.next_ms, timer.shared.seq)).is_none() {
            return false;
        }
        state.next_ms = now_ms() + state.interval_ms;
        timers.insert((state.next_ms, timer.shared.seq), timer.shared.clone());
        true
    }

    /// Change the interval to `ms`. With `from_now` the new deadline is
    /// `now + ms`, otherwise it keeps the original start point. Asking for
    /// the current interval without `from_now` is a no-op that returns true.
    pub fn reset(&self, timer: &Timer, ms: u64, from_now: bool) -> bool {
        {
            let mut timers = self.timers.write().unwrap();
            let mut state = timer.shared.state.lock().unwrap();
            if ms == state.interval_ms && !from_now {
                return true;
            }
            if state.cb.is_none() {
                return false;
            }
            if timers.remove(&(state.next_ms, timer.shared.seq)).is_none() {
                return false;
            }
            let start = if from_now {
                now_ms()
            } else {
                state.next_ms.saturating_sub(state.interval_ms)
            };
            state.interval_ms = ms;
            state.next_ms = start.saturating_add(ms);
        }
        // Reinsert through the common path so a new earliest deadline
        // still wakes the poller.
        self.insert(&timer.shared);
        true
    }

    fn insert(&self, shared: &Arc<TimerShared>) {
        let key = {
            let state = shared.state.lock().unwrap();
            (state.next_ms, shared.seq)
        };
        let at_front;
        {
            let mut timers = self.timers.write().unwrap();
            timers.insert(key, shared.clone());
            at_front = timers.keys().next() == Some(&key) && !self.tickled.load(Ordering::Relaxed);
            if at_front {
                self.tickled.store(true, Ordering::Relaxed);
            }
        }
        if at_front {
            if let Some(hook) = self.wake_hook.get() {
                hook();
            }
        }
    }

    fn detect_rollover(&self, now: u64) -> bool {
        let previous = self.previous_ms.swap(now, Ordering::Relaxed);
        now.saturating_add(ROLLOVER_MS) < previous
    }

    /// Test-only: pretend the last observed wall clock was `ms`
    #[cfg(test)]
    fn force_previous_ms(&self, ms: u64) {
        self.previous_ms.store(ms, Ordering::Relaxed);
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn drain(mgr: &TimerManager) -> Vec<TimerCallback> {
        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        out
    }

    #[test]
    fn test_expiry_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for ms in [50u64, 40, 30, 20, 10] {
            let o = order.clone();
            mgr.add_timer(ms, move || o.lock().unwrap().push(ms), false);
        }

        std::thread::sleep(std::time::Duration::from_millis(60));
        for cb in drain(&mgr) {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30, 40, 50]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_only_due_timers_drain() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        mgr.add_timer(1, move || { f.fetch_add(1, Ordering::Relaxed); }, false);
        let f = fired.clone();
        mgr.add_timer(60_000, move || { f.fetch_add(100, Ordering::Relaxed); }, false);

        std::thread::sleep(std::time::Duration::from_millis(10));
        for cb in drain(&mgr) {
            cb();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = mgr.add_timer(5, move || { f.fetch_add(1, Ordering::Relaxed); }, true);

        for _ in 0..3 {
            std::thread::sleep(std::time::Duration::from_millis(8));
            for cb in drain(&mgr) {
                cb();
            }
        }
        assert_eq!(fired.load(Ordering::Relaxed), 3);
        assert!(mgr.has_timer());
        assert!(mgr.cancel(&timer));
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_cancel_idempotent() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10_000, || {}, false);
        assert!(mgr.cancel(&timer));
        assert!(!mgr.cancel(&timer));
        assert!(timer.is_spent());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = mgr.add_timer(1, move || { f.fetch_add(1, Ordering::Relaxed); }, false);
        mgr.cancel(&timer);

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(drain(&mgr).is_empty());
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(20, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert!(mgr.refresh(&timer));

        // Original deadline has passed, refreshed one has not
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(drain(&mgr).is_empty());
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_reset_same_interval_is_noop() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1000, || {}, false);
        let before = mgr.next_timer_ms();
        assert!(mgr.reset(&timer, 1000, false));
        let after = mgr.next_timer_ms();
        assert!(after <= before && before.saturating_sub(after) < 100);
    }

    #[test]
    fn test_reset_from_now() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10, || {}, false);
        assert!(mgr.reset(&timer, 10_000, true));
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert!(drain(&mgr).is_empty());
        assert!(mgr.cancel(&timer));
        assert!(!mgr.reset(&timer, 5, true));
    }

    #[test]
    fn test_next_timer_ms_boundaries() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer_ms(), NO_TIMEOUT);
        let t = mgr.add_timer(500, || {}, false);
        let next = mgr.next_timer_ms();
        assert!(next > 0 && next <= 500);
        mgr.cancel(&t);

        mgr.add_timer(0, || {}, false);
        assert_eq!(mgr.next_timer_ms(), 0);
    }

    #[test]
    fn test_clock_rollover_expires_everything() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let f = fired.clone();
            mgr.add_timer(600_000, move || { f.fetch_add(1, Ordering::Relaxed); }, false);
        }

        // Pretend the clock last read two hours in the future, i.e. it has
        // since jumped backward by two hours.
        mgr.force_previous_ms(now_ms() + 2 * ROLLOVER_MS);
        for cb in drain(&mgr) {
            cb();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 3);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_condition_timer_skips_dead_token() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let live = Arc::new(());
        let f = fired.clone();
        mgr.add_condition_timer(1, move || { f.fetch_add(1, Ordering::Relaxed); }, Arc::downgrade(&live), false);

        let dead = Arc::new(());
        let weak_dead = Arc::downgrade(&dead);
        drop(dead);
        let f = fired.clone();
        mgr.add_condition_timer(1, move || { f.fetch_add(100, Ordering::Relaxed); }, weak_dead, false);

        std::thread::sleep(std::time::Duration::from_millis(5));
        for cb in drain(&mgr) {
            cb();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_wake_hook_fires_on_new_head() {
        let mgr = TimerManager::new();
        let woken = Arc::new(AtomicUsize::new(0));
        let w = woken.clone();
        mgr.set_wake_hook(Box::new(move || { w.fetch_add(1, Ordering::Relaxed); }));

        mgr.add_timer(1000, || {}, false);
        assert_eq!(woken.load(Ordering::Relaxed), 1);

        // Not at the head, and head-change already notified: no wake
        mgr.add_timer(2000, || {}, false);
        assert_eq!(woken.load(Ordering::Relaxed), 1);

        // A poll re-arms the notification, so a new head wakes again
        mgr.next_timer_ms();
        mgr.add_timer(10, || {}, false);
        assert_eq!(woken.load(Ordering::Relaxed), 2);
    }
}
