//! Stackful fibers
//!
//! A fiber is a suspendable computation with a private stack, distinct from
//! the OS thread running it. Exactly one fiber per worker thread is Running
//! at any instant. Fibers are `Arc`-shared: the scheduler queue, a reactor
//! event slot and the running context may all hold references to the same
//! fiber at once.
//!
//! Each worker thread keeps three thread-local registrations:
//! the *current* fiber, the *thread-main* fiber (the flow of execution the
//! thread started with) and the *scheduler* fiber (the yield target for
//! fibers running under a scheduler). On a plain worker the thread-main and
//! scheduler fibers are the same; a caller-thread worker separates them so
//! the scheduler loop does not hijack the caller's original stack.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use weft_core::{FiberId, FiberState};

use crate::context::{Context, Stack};

/// Default fiber stack size: 128 KiB
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Entry function run by a task fiber
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Count of live fibers, for leak checks
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// The flow of execution this thread started with
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Yield target for fibers with `run_in_scheduler`
    static SCHEDULER_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// A stackful task with states Ready / Running / Terminated
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    ctx: Context,
    stack: Option<Stack>,
    entry: Mutex<Option<FiberFn>>,
    /// Yield back to the scheduler fiber rather than the thread-main fiber
    run_in_scheduler: bool,
    /// Serializes resume attempts from racing workers
    pub(crate) run_lock: Mutex<()>,
}

impl Fiber {
    /// Privileged thread-main constructor.
    ///
    /// Captures the calling flow of execution as a Running fiber and
    /// installs it as this thread's current and default scheduler fiber.
    /// Returns the existing registration on repeat calls.
    pub fn ensure_main() -> Arc<Fiber> {
        if let Some(f) = Self::current() {
            return f;
        }
        let main = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running as u8),
            ctx: Context::new(),
            stack: None,
            entry: Mutex::new(None),
            run_in_scheduler: false,
            run_lock: Mutex::new(()),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_MAIN.with(|c| *c.borrow_mut() = Some(main.clone()));
        // The main fiber doubles as the scheduler fiber until one is set
        SCHEDULER_FIBER.with(|c| *c.borrow_mut() = Some(main.clone()));
        main
    }

    /// Task constructor: Ready fiber with its own stack.
    ///
    /// `stack_size == 0` selects [`DEFAULT_STACK_SIZE`].
    pub fn new(cb: FiberFn, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber> {
        let size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let stack = Stack::new(size);
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            ctx: Context::new(),
            stack: Some(stack),
            entry: Mutex::new(Some(cb)),
            run_in_scheduler,
            run_lock: Mutex::new(()),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        unsafe { fiber.ctx.bind(fiber.stack.as_ref().unwrap(), fiber_entry, 0) };
        fiber
    }

    /// The fiber currently running on this thread
    pub fn current() -> Option<Arc<Fiber>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Id of the current fiber, or the all-ones sentinel off-fiber
    pub fn fiber_id() -> u64 {
        Self::current().map(|f| f.id().as_u64()).unwrap_or(u64::MAX)
    }

    /// Install `f` as this thread's scheduler fiber (the yield target for
    /// fibers running under a scheduler).
    pub fn set_scheduler_fiber(f: &Arc<Fiber>) {
        SCHEDULER_FIBER.with(|c| *c.borrow_mut() = Some(f.clone()));
    }

    /// Number of fibers currently alive in the process
    pub fn live_count() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Switch the calling thread into this fiber.
    ///
    /// The caller must be executing on the thread's scheduler fiber (or
    /// thread-main fiber for `run_in_scheduler == false` fibers); control
    /// returns here when the fiber yields or terminates.
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(self.state(), FiberState::Ready, "resume of a non-Ready fiber");
        self.set_state(FiberState::Running);

        let target = self.switch_target();
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        unsafe { Context::switch(&target.ctx, &self.ctx) };
    }

    /// Give up the CPU: back to Ready (unless Terminated) and switch out to
    /// the scheduler or thread-main fiber.
    pub fn yield_fiber(&self) {
        let state = self.state();
        assert!(
            state == FiberState::Running || state == FiberState::Terminated,
            "yield of a fiber that is not on-CPU"
        );
        if state != FiberState::Terminated {
            self.set_state(FiberState::Ready);
        }

        let target = self.switch_target();
        CURRENT.with(|c| *c.borrow_mut() = Some(target.clone()));
        unsafe { Context::switch(&self.ctx, &target.ctx) };
    }

    /// Re-arm a Terminated fiber with a new entry on its existing stack
    pub fn reset(&self, cb: FiberFn) {
        assert!(self.stack.is_some(), "reset of a stackless fiber");
        assert_eq!(self.state(), FiberState::Terminated, "reset of a live fiber");
        *self.entry.lock().unwrap() = Some(cb);
        unsafe { self.ctx.bind(self.stack.as_ref().unwrap(), fiber_entry, 0) };
        self.set_state(FiberState::Ready);
    }

    fn switch_target(&self) -> Arc<Fiber> {
        let target = if self.run_in_scheduler {
            SCHEDULER_FIBER.with(|c| c.borrow().clone())
        } else {
            THREAD_MAIN.with(|c| c.borrow().clone())
        };
        target.expect("no scheduler/thread-main fiber registered on this thread")
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Trampoline every task fiber starts in.
///
/// Runs the entry to completion, marks the fiber Terminated and yields for
/// good. The local strong reference is dropped before that final yield so
/// only outer holders keep the fiber alive; the yield itself goes through a
/// raw pointer because the stack this code runs on belongs to the fiber.
extern "C" fn fiber_entry(_arg: usize) {
    let curr = Fiber::current().expect("fiber entry without a current fiber");

    let cb = curr.entry.lock().unwrap().take();
    if let Some(cb) = cb {
        cb();
    }
    curr.set_state(FiberState::Terminated);

    let raw: *const Fiber = Arc::as_ptr(&curr);
    drop(curr);
    unsafe { (*raw).yield_fiber() };

    unreachable!("terminated fiber resumed past its final yield");
}
