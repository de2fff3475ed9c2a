//! # weft-runtime
//!
//! The execution core of the weft fiber runtime:
//!
//! - [`context`] — the machine-context primitive (arch-specific save/
//!   restore/switch of callee-saved state)
//! - [`fiber`] — stackful fibers with resume / yield / reset
//! - [`thread`] — worker threads with start synchronization
//! - [`timer`] — the ordered, wall-clock timer set
//! - [`scheduler`] — the FIFO task queue, worker loop and the [`Schedule`]
//!   seam that reactor-style extensions override
//!
//! The io layer (epoll reactor and syscall hooks) lives in `weft-io`, which
//! builds on the types exported here.

pub mod arch;
pub mod context;
pub mod fiber;
pub mod scheduler;
pub mod thread;
pub mod timer;

pub use weft_core::{FiberId, FiberState};

pub use context::{Context, Stack};
pub use fiber::{Fiber, FiberFn, DEFAULT_STACK_SIZE};
pub use scheduler::{Schedule, ScheduleTask, Scheduler, Task};
pub use thread::{current_name, current_tid, Semaphore, WorkerThread};
pub use timer::{now_ms, Timer, TimerCallback, TimerManager, NO_TIMEOUT};
