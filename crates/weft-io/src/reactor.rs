//! epoll reactor
//!
//! [`IoScheduler`] extends the scheduler: its idle fiber parks the worker
//! in `epoll_wait`, gated by the earliest timer deadline, and converts fd
//! readiness and timer expiry back into scheduler tasks. Each fd the
//! reactor has seen owns an [`FdContext`] holding one event slot per
//! direction; a slot stores at most one waiter (a suspended fiber or a
//! callback) together with the scheduler that originated the wait.
//!
//! Workers blocked in `epoll_wait` are woken through the *tickle pipe*: an
//! anonymous pipe whose read end is registered edge-triggered, so a single
//! written byte unblocks exactly one waiter.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bitflags::bitflags;
use libc::{c_int, c_void};
use weft_core::{wdebug, werror, WeftError, WeftResult};
use weft_runtime::scheduler::{Schedule, ScheduleTask, Scheduler};
use weft_runtime::{Fiber, FiberFn, FiberState, Timer, TimerManager, NO_TIMEOUT};

use crate::hook;

bitflags! {
    /// Readiness directions, numerically identical to their epoll bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoEvent: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

/// Ceiling on one `epoll_wait`: caps timer drift and keeps shutdown
/// opportunistic even with no timers and no traffic.
const MAX_TIMEOUT_MS: u64 = 5000;

/// `epoll_event.u64` sentinel for the tickle pipe
const TICKLE_TOKEN: u64 = 0;

const MAX_EVENTS: usize = 256;

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

/// One pending waiter for a (fd, direction)
struct EventSlot {
    /// Scheduler that originated the wait; the wake-up is submitted there
    scheduler: Weak<IoScheduler>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

impl EventSlot {
    fn vacant() -> EventSlot {
        EventSlot { scheduler: Weak::new(), fiber: None, cb: None }
    }

    fn is_vacant(&self) -> bool {
        self.fiber.is_none() && self.cb.is_none()
    }
}

struct FdInner {
    /// Directions currently registered; a slot is occupied iff its bit is set
    events: IoEvent,
    read: EventSlot,
    write: EventSlot,
}

impl FdInner {
    fn slot_mut(&mut self, event: IoEvent) -> &mut EventSlot {
        if event == IoEvent::READ {
            &mut self.read
        } else if event == IoEvent::WRITE {
            &mut self.write
        } else {
            unreachable!("slot lookup wants exactly one direction")
        }
    }

    /// Consume the slot for `event`: clear the direction bit and hand the
    /// stored waiter back to its scheduler.
    fn trigger(&mut self, event: IoEvent) {
        assert!(self.events.contains(event), "trigger of an unregistered event");
        self.events.remove(event);

        let slot = self.slot_mut(event);
        let scheduler = std::mem::replace(&mut slot.scheduler, Weak::new());
        let fiber = slot.fiber.take();
        let cb = slot.cb.take();

        if let Some(scheduler) = scheduler.upgrade() {
            if let Some(cb) = cb {
                scheduler.submit(ScheduleTask::call(cb, None));
            } else if let Some(fiber) = fiber {
                scheduler.submit(ScheduleTask::fiber(fiber, None));
            }
        }
    }
}

/// Per-fd reactor state
pub(crate) struct FdContext {
    fd: c_int,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: c_int) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdInner {
                events: IoEvent::empty(),
                read: EventSlot::vacant(),
                write: EventSlot::vacant(),
            }),
        }
    }
}

thread_local! {
    static CURRENT_IO: RefCell<Option<Weak<IoScheduler>>> = const { RefCell::new(None) };
}

/// Scheduler + epoll reactor + timer set.
///
/// Constructing one starts its worker pool immediately; call
/// [`Schedule::stop`] to shut it down.
pub struct IoScheduler {
    sched: Scheduler,
    timers: TimerManager,
    epfd: c_int,
    /// [0] read end (registered edge-triggered), [1] write end
    tickle_fds: [c_int; 2],
    pending: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    self_ref: Weak<IoScheduler>,
}

impl IoScheduler {
    /// Build and start a reactor over `threads` workers.
    ///
    /// With `use_caller` the constructing thread counts as a worker and the
    /// final drain runs on its stack during `stop`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> WeftResult<Arc<IoScheduler>> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(WeftError::last_os_error());
        }

        let mut pipe_fds = [0 as c_int; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let err = WeftError::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        // Edge-triggered read end must be non-blocking so the drain loop
        // can read until EAGAIN.
        let flags = unsafe { libc::fcntl(pipe_fds[0], libc::F_GETFL, 0) };
        unsafe { libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) };

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: TICKLE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) } != 0 {
            let err = WeftError::last_os_error();
            unsafe {
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
                libc::close(epfd);
            }
            return Err(err);
        }

        let mut contexts = Vec::with_capacity(32);
        for fd in 0..32 {
            contexts.push(Arc::new(FdContext::new(fd)));
        }

        let io = Arc::new_cyclic(|weak: &Weak<IoScheduler>| IoScheduler {
            sched: Scheduler::core(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe_fds,
            pending: AtomicUsize::new(0),
            fd_contexts: RwLock::new(contexts),
            self_ref: weak.clone(),
        });

        // A new earliest deadline may undercut the timeout currently gating
        // epoll_wait, so the timer set pokes the pipe.
        let weak = Arc::downgrade(&io);
        io.timers.set_wake_hook(Box::new(move || {
            if let Some(io) = weak.upgrade() {
                io.tickle();
            }
        }));

        io.start();
        Ok(io)
    }

    /// The reactor owning the calling worker thread, if any
    pub fn current() -> Option<Arc<IoScheduler>> {
        CURRENT_IO.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Waiters currently registered across all fds
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn lookup(&self, fd: c_int) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.fd_contexts.read().unwrap().get(fd as usize).cloned()
    }

    fn context_for(&self, fd: c_int) -> Arc<FdContext> {
        if let Some(ctx) = self.lookup(fd) {
            return ctx;
        }
        let idx = fd as usize;
        let mut table = self.fd_contexts.write().unwrap();
        if table.len() <= idx {
            let target = (idx * 3 / 2).max(idx + 1);
            while table.len() < target {
                let next_fd = table.len() as c_int;
                table.push(Arc::new(FdContext::new(next_fd)));
            }
        }
        table[idx].clone()
    }

    /// Register a waiter for (fd, direction).
    ///
    /// With a callback, the callback is scheduled when the direction fires;
    /// without one, the *current* fiber is parked in the slot and the
    /// caller is expected to yield immediately after.
    ///
    /// At most one waiter per (fd, direction): a second registration fails
    /// with [`WeftError::AlreadyRegistered`].
    pub fn add_event(&self, fd: c_int, event: IoEvent, cb: Option<FiberFn>) -> WeftResult<()> {
        assert!(event == IoEvent::READ || event == IoEvent::WRITE);
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock().unwrap();

        if inner.events.contains(event) {
            return Err(WeftError::AlreadyRegistered);
        }

        let op = if inner.events.is_empty() { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | inner.events.bits() | event.bits(),
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            werror!("add_event: epoll_ctl({}, {:?}) failed: errno {}", fd, event, errno());
            return Err(WeftError::Invalid);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events.insert(event);

        let scheduler = self.self_ref.clone();
        let slot = inner.slot_mut(event);
        debug_assert!(slot.is_vacant(), "occupied slot behind a clear direction bit");
        slot.scheduler = scheduler;
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let fiber = Fiber::current().expect("add_event without a callback or fiber");
                assert_eq!(fiber.state(), FiberState::Running);
                slot.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Unregister (fd, direction) without running its waiter
    pub fn del_event(&self, fd: c_int, event: IoEvent) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let remaining = inner.events - event;
        let op = if remaining.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | remaining.bits(),
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            werror!("del_event: epoll_ctl({}, {:?}) failed: errno {}", fd, event, errno());
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.events = remaining;
        let slot = inner.slot_mut(event);
        *slot = EventSlot::vacant();
        true
    }

    /// Unregister (fd, direction) and run its waiter now: a synthesized
    /// spurious wake-up, used by timeouts.
    pub fn cancel_event(&self, fd: c_int, event: IoEvent) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let remaining = inner.events - event;
        let op = if remaining.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | remaining.bits(),
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            werror!("cancel_event: epoll_ctl({}, {:?}) failed: errno {}", fd, event, errno());
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.trigger(event);
        true
    }

    /// Unregister everything on `fd`, waking both waiters
    pub fn cancel_all(&self, fd: c_int) -> bool {
        let Some(ctx) = self.lookup(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }

        let mut ev = libc::epoll_event { events: 0, u64: Arc::as_ptr(&ctx) as u64 };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) } != 0 {
            werror!("cancel_all: epoll_ctl({}) failed: errno {}", fd, errno());
            return false;
        }

        if inner.events.contains(IoEvent::READ) {
            inner.trigger(IoEvent::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events.contains(IoEvent::WRITE) {
            inner.trigger(IoEvent::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        assert!(inner.events.is_empty());
        true
    }

    // ── timers ──────────────────────────────────────────────────────

    /// Run `cb` after `ms` milliseconds (on some worker)
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Like [`IoScheduler::add_timer`], but the callback is skipped if
    /// `cond` has expired by the deadline.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn cancel_timer(&self, timer: &Timer) -> bool {
        self.timers.cancel(timer)
    }

    pub fn refresh_timer(&self, timer: &Timer) -> bool {
        self.timers.refresh(timer)
    }

    pub fn reset_timer(&self, timer: &Timer, ms: u64, from_now: bool) -> bool {
        self.timers.reset(timer, ms, from_now)
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    // ── idle body ───────────────────────────────────────────────────

    fn idle_loop(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut expired: Vec<weft_runtime::TimerCallback> = Vec::new();

        while !Schedule::stopping(self) {
            // Park until readiness, the earliest deadline, or a tickle
            let ready = loop {
                let timeout = self.timers.next_timer_ms().min(MAX_TIMEOUT_MS);
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as c_int,
                        timeout as c_int,
                    )
                };
                if rc < 0 && errno() == libc::EINTR {
                    continue;
                }
                break rc.max(0) as usize;
            };

            // Expired timers become ordinary scheduler tasks
            self.timers.drain_expired(&mut expired);
            for cb in expired.drain(..) {
                self.submit(ScheduleTask::call(move || cb(), None));
            }

            for i in 0..ready {
                let ev = events[i];
                if ev.u64 == TICKLE_TOKEN {
                    // Edge-triggered: the pipe must be read dry
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(self.tickle_fds[0], buf.as_mut_ptr() as *mut c_void, buf.len())
                    } > 0
                    {}
                    continue;
                }

                let ctx = unsafe { &*(ev.u64 as *const FdContext) };
                let mut inner = ctx.inner.lock().unwrap();

                // Error/hangup counts as readiness for whatever is registered
                let mut revents = ev.events;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
                }
                let real = IoEvent::from_bits_truncate(revents) & inner.events;
                if real.is_empty() {
                    continue;
                }

                let remaining = inner.events - real;
                let op = if remaining.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
                let mut modev = libc::epoll_event {
                    events: libc::EPOLLET as u32 | remaining.bits(),
                    u64: ev.u64,
                };
                if unsafe { libc::epoll_ctl(self.epfd, op, ctx.fd, &mut modev) } != 0 {
                    werror!("idle: epoll_ctl({}) failed: errno {}", ctx.fd, errno());
                    continue;
                }

                if real.contains(IoEvent::READ) {
                    inner.trigger(IoEvent::READ);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if real.contains(IoEvent::WRITE) {
                    inner.trigger(IoEvent::WRITE);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Hand the batch to the run loop
            match Fiber::current() {
                Some(f) => f.yield_fiber(),
                None => return,
            }
        }
        wdebug!("reactor {}: idle fiber exiting", self.sched.name());
    }
}

impl Schedule for IoScheduler {
    fn base(&self) -> &Scheduler {
        &self.sched
    }

    fn self_arc(&self) -> Arc<IoScheduler> {
        self.self_ref.upgrade().expect("reactor used after drop")
    }

    /// Wake one parked worker by writing a byte into the tickle pipe
    fn tickle(&self) {
        if !self.sched.has_idle_workers() {
            return;
        }
        let rc = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const c_void, 1) };
        debug_assert_eq!(rc, 1);
    }

    /// Shutdown also requires no timers and no registered waiters
    fn stopping(&self) -> bool {
        self.timers.next_timer_ms() == NO_TIMEOUT
            && self.pending.load(Ordering::Acquire) == 0
            && self.sched.base_stopping()
    }

    fn on_thread_start(&self) {
        CURRENT_IO.with(|c| *c.borrow_mut() = Some(self.self_ref.clone()));
        hook::set_hook_enabled(true);
    }

    fn idle(&self) {
        self.idle_loop();
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
