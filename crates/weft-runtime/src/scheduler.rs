//! Cooperative fiber scheduler
//!
//! A FIFO queue of tasks (fibers or callbacks, each with optional worker
//! affinity) drained by a fixed pool of worker threads. When a worker finds
//! nothing runnable it resumes its *idle fiber*; extensions override the
//! idle body to block productively (the reactor parks in `epoll_wait`
//! there). The [`Schedule`] trait is the seam for those overrides: `tickle`
//! wakes idle workers, `stopping` extends the shutdown predicate,
//! `on_thread_start` installs per-worker state.
//!
//! With `use_caller`, the constructing thread is one of the requested
//! workers: `start` builds a dedicated scheduler fiber on the caller and
//! `stop` drains the queue on the caller's stack before joining the rest.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use libc::pid_t;
use weft_core::{wdebug, FiberState, WeftError, WeftResult};

use crate::fiber::{Fiber, FiberFn};
use crate::thread::{current_tid, WorkerThread};

/// What a scheduler runs: an existing fiber, or a callback that gets
/// wrapped in a fresh fiber when it reaches a worker.
pub enum Task {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

/// A queued unit of work with optional worker affinity
pub struct ScheduleTask {
    pub task: Task,
    /// Kernel tid of the only worker allowed to run this; `None` = any
    pub affinity: Option<pid_t>,
}

impl ScheduleTask {
    pub fn fiber(fiber: Arc<Fiber>, affinity: Option<pid_t>) -> ScheduleTask {
        ScheduleTask { task: Task::Fiber(fiber), affinity }
    }

    pub fn call<F>(f: F, affinity: Option<pid_t>) -> ScheduleTask
    where
        F: FnOnce() + Send + 'static,
    {
        ScheduleTask { task: Task::Call(Box::new(f)), affinity }
    }
}

/// Shared scheduler state: queue, workers, counters.
///
/// Use [`Scheduler::new`] for a standalone scheduler; extensions embed a
/// [`Scheduler::core`] and implement [`Schedule`] around it.
pub struct Scheduler {
    name: String,
    tasks: Mutex<VecDeque<ScheduleTask>>,
    workers: Mutex<Vec<WorkerThread>>,
    worker_tids: Mutex<Vec<pid_t>>,
    /// Worker threads to spawn (excludes the caller when `use_caller`)
    thread_count: usize,
    use_caller: bool,
    /// Caller tid when `use_caller`, else -1
    root_tid: pid_t,
    /// Scheduler fiber living on the caller's stack when `use_caller`
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    started: AtomicBool,
    self_ref: Mutex<Weak<Scheduler>>,
}

impl Scheduler {
    /// Standalone scheduler over `threads` workers.
    ///
    /// With `use_caller` the constructing thread is counted as one of the
    /// workers; `start` and `stop` must then run on this same thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        let sched = Arc::new(Self::core(threads, use_caller, name));
        *sched.self_ref.lock().unwrap() = Arc::downgrade(&sched);
        sched
    }

    /// Bare scheduler state for embedding in a [`Schedule`] implementor
    pub fn core(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads > 0, "scheduler needs at least one thread");
        let (thread_count, root_tid) =
            if use_caller { (threads - 1, current_tid()) } else { (threads, -1) };
        Scheduler {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            worker_tids: Mutex::new(Vec::new()),
            thread_count,
            use_caller,
            root_tid,
            caller_fiber: Mutex::new(None),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            self_ref: Mutex::new(Weak::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel tids of the spawned workers (plus the caller, if it counts)
    pub fn worker_tids(&self) -> Vec<pid_t> {
        self.worker_tids.lock().unwrap().clone()
    }

    /// Push a task; returns true when the queue was empty, i.e. idle
    /// workers may need a tickle.
    fn push_task(&self, task: ScheduleTask) -> bool {
        let mut queue = self.tasks.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_back(task);
        was_empty
    }

    /// Any worker currently parked in the idle fiber?
    pub fn has_idle_workers(&self) -> bool {
        self.idle.load(Ordering::Acquire) > 0
    }

    /// Shutdown requested (the queue may still be draining)
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// The base shutdown predicate: stop requested, queue empty, nothing
    /// mid-flight. Extensions AND in their own conditions.
    pub fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.tasks.lock().unwrap().is_empty()
            && self.active.load(Ordering::Acquire) == 0
    }
}

impl Schedule for Scheduler {
    fn base(&self) -> &Scheduler {
        self
    }

    fn self_arc(&self) -> Arc<Scheduler> {
        self.self_ref
            .lock()
            .unwrap()
            .upgrade()
            .expect("scheduler core used without an owning Arc")
    }
}

/// The scheduler seam. `base` and `self_arc` wire an implementor to its
/// embedded [`Scheduler`]; the overridable methods mirror what a subclass
/// would override, and everything else is provided machinery.
pub trait Schedule: Send + Sync + Sized + 'static {
    fn base(&self) -> &Scheduler;

    fn self_arc(&self) -> Arc<Self>;

    /// Wake one idle worker. The base scheduler has no blocking wait, so
    /// nothing to do.
    fn tickle(&self) {}

    /// May the worker loops exit?
    fn stopping(&self) -> bool {
        self.base().base_stopping()
    }

    /// Per-worker setup, run first thing on every worker thread
    fn on_thread_start(&self) {}

    /// Body of the idle fiber: runs when a worker has nothing to do, and
    /// must yield between rounds so the worker can recheck the queue.
    fn idle(&self) {
        while !self.stopping() {
            std::thread::sleep(Duration::from_millis(50));
            match Fiber::current() {
                Some(f) => f.yield_fiber(),
                None => return,
            }
        }
    }

    /// Spawn the worker pool (and the caller's scheduler fiber, with
    /// `use_caller`). Idempotent.
    fn start(&self) {
        let base = self.base();
        if base.started.swap(true, Ordering::SeqCst) {
            return;
        }
        wdebug!("scheduler {}: starting {} workers", base.name, base.thread_count);

        if base.use_caller {
            assert_eq!(
                current_tid(),
                base.root_tid,
                "use_caller scheduler must start on its constructing thread"
            );
            Fiber::ensure_main();
            let this = self.self_arc();
            let caller = Fiber::new(Box::new(move || run_loop(this)), 0, false);
            Fiber::set_scheduler_fiber(&caller);
            *base.caller_fiber.lock().unwrap() = Some(caller);
            base.worker_tids.lock().unwrap().push(base.root_tid);
        }

        let mut workers = base.workers.lock().unwrap();
        for i in 0..base.thread_count {
            let this = self.self_arc();
            let worker = WorkerThread::spawn(&format!("{}-{}", base.name, i), move || {
                run_loop(this)
            })
            .expect("failed to spawn scheduler worker");
            base.worker_tids.lock().unwrap().push(worker.tid());
            workers.push(worker);
        }
    }

    /// Request shutdown, wake every worker, drain on the caller when it
    /// counts as a worker, and join the pool.
    fn stop(&self) {
        let base = self.base();
        if self.stopping() {
            return;
        }
        base.stopping.store(true, Ordering::Release);
        wdebug!("scheduler {}: stopping", base.name);

        if base.use_caller {
            assert_eq!(
                current_tid(),
                base.root_tid,
                "use_caller scheduler must stop on its constructing thread"
            );
        }

        for _ in 0..base.thread_count {
            self.tickle();
        }

        let caller = base.caller_fiber.lock().unwrap().clone();
        if caller.is_some() {
            self.tickle();
        }
        if let Some(fiber) = caller {
            // Run the drain loop on the caller's stack
            fiber.resume();
        }

        let workers: Vec<WorkerThread> = std::mem::take(&mut *base.workers.lock().unwrap());
        for mut worker in workers {
            worker.join();
        }
    }

    /// Queue a task. Fails once `stop` has begun.
    fn schedule(&self, task: ScheduleTask) -> WeftResult<()> {
        if self.base().stopping.load(Ordering::Acquire) {
            return Err(WeftError::SchedulerStopped);
        }
        self.submit(task);
        Ok(())
    }

    /// Queue a fiber for any worker
    fn schedule_fiber(&self, fiber: Arc<Fiber>) -> WeftResult<()> {
        self.schedule(ScheduleTask::fiber(fiber, None))
    }

    /// Queue a callback for any worker
    fn schedule_call<F>(&self, f: F) -> WeftResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(ScheduleTask::call(f, None))
    }

    /// Internal wake-up path: queue a task unconditionally. Event triggers
    /// and timer drains use this so the stop-drain still completes.
    fn submit(&self, task: ScheduleTask) {
        if self.base().push_task(task) {
            self.tickle();
        }
    }
}

/// Per-worker loop: scan the queue front for the first task this worker may
/// run, resume it, or fall into the idle fiber. Exits when the idle fiber
/// terminates.
fn run_loop<S: Schedule>(this: Arc<S>) {
    let tid = current_tid();
    this.on_thread_start();
    Fiber::ensure_main();

    let idle_this = this.clone();
    let idle_fiber = Fiber::new(Box::new(move || idle_this.idle()), 0, true);
    wdebug!("scheduler {}: run loop on tid {}", this.base().name, tid);

    loop {
        let base = this.base();
        let mut task = None;
        let mut tickle_me = false;
        {
            let mut queue = base.tasks.lock().unwrap();
            let mut pick = None;
            for (i, queued) in queue.iter().enumerate() {
                if let Some(affinity) = queued.affinity {
                    if affinity != tid {
                        // Someone else's task: leave it, wake them later
                        tickle_me = true;
                        continue;
                    }
                }
                pick = Some(i);
                break;
            }
            if let Some(i) = pick {
                task = queue.remove(i);
                base.active.fetch_add(1, Ordering::SeqCst);
            }
        }
        if tickle_me {
            this.tickle();
        }

        match task {
            Some(ScheduleTask { task: Task::Fiber(fiber), .. }) => {
                {
                    let _running = fiber.run_lock.lock().unwrap();
                    if fiber.state() != FiberState::Terminated {
                        fiber.resume();
                    }
                }
                base.active.fetch_sub(1, Ordering::SeqCst);
            }
            Some(ScheduleTask { task: Task::Call(cb), .. }) => {
                let fiber = Fiber::new(cb, 0, true);
                {
                    let _running = fiber.run_lock.lock().unwrap();
                    fiber.resume();
                }
                base.active.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if idle_fiber.state() == FiberState::Terminated {
                    wdebug!("scheduler {}: run loop ends on tid {}", base.name, tid);
                    break;
                }
                base.idle.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                base.idle.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    // Pass the shutdown along: siblings may still be parked in a blocking
    // idle wait and would otherwise only notice at their next timeout.
    this.tickle();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(deadline_ms: u64, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed().as_millis() < deadline_ms as u128 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_callbacks_all_run() {
        let sched = Scheduler::new(2, false, "sched-test");
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let c = count.clone();
            sched.schedule_call(move || { c.fetch_add(1, Ordering::SeqCst); }).unwrap();
        }

        assert!(wait_until(2000, || count.load(Ordering::SeqCst) == 16));
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_fiber_task_runs_and_yields() {
        let sched = Scheduler::new(1, false, "sched-fiber");
        sched.start();

        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::current().unwrap().yield_fiber();
                s.fetch_add(1, Ordering::SeqCst);
            }),
            0,
            true,
        );
        sched.schedule_fiber(fiber.clone()).unwrap();

        assert!(wait_until(2000, || steps.load(Ordering::SeqCst) == 1));
        assert_eq!(fiber.state(), FiberState::Ready);

        // A yielded-but-runnable fiber is only re-run when rescheduled
        sched.schedule_fiber(fiber.clone()).unwrap();
        assert!(wait_until(2000, || steps.load(Ordering::SeqCst) == 2));
        assert_eq!(fiber.state(), FiberState::Terminated);

        sched.stop();
    }

    #[test]
    fn test_affinity_is_honored() {
        let sched = Scheduler::new(3, false, "sched-affinity");
        sched.start();

        let tids = sched.worker_tids();
        assert_eq!(tids.len(), 3);
        let target = tids[1];

        let observed = Arc::new(AtomicUsize::new(0));
        let o = observed.clone();
        sched
            .schedule(ScheduleTask::call(
                move || { o.store(current_tid() as usize, Ordering::SeqCst); },
                Some(target),
            ))
            .unwrap();

        assert!(wait_until(2000, || observed.load(Ordering::SeqCst) != 0));
        assert_eq!(observed.load(Ordering::SeqCst), target as usize);
        sched.stop();
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "sched-caller");
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let c = count.clone();
            sched.schedule_call(move || { c.fetch_add(1, Ordering::SeqCst); }).unwrap();
        }
        // No spawned workers: everything runs on this stack during stop()
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_schedule_after_stop_fails() {
        let sched = Scheduler::new(1, false, "sched-stopped");
        sched.start();
        sched.stop();
        let err = sched.schedule_call(|| {}).unwrap_err();
        assert_eq!(err, WeftError::SchedulerStopped);
    }
}
