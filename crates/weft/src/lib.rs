//! # weft — stackful fibers over epoll
//!
//! A user-space cooperative concurrency runtime for Linux: stackful fibers
//! multiplexed onto a fixed pool of worker threads, driven by an
//! edge-triggered epoll reactor and an ordered timer set. Blocking socket
//! calls made through the hook layer suspend the calling fiber until the fd
//! is ready or a deadline fires; the worker thread keeps running other
//! fibers in the meantime.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::net::Ipv4Addr;
//! use weft::{IoScheduler, Schedule, TcpListener};
//!
//! fn main() {
//!     let io = IoScheduler::new(4, false, "echo").unwrap();
//!
//!     io.schedule_call(|| {
//!         let listener = TcpListener::bind(Ipv4Addr::LOCALHOST, 9000).unwrap();
//!         loop {
//!             // Straight-line blocking code; only this fiber waits
//!             let stream = listener.accept().unwrap();
//!             let mut buf = [0u8; 512];
//!             let n = stream.read(&mut buf);
//!             if n > 0 {
//!                 stream.write_all(&buf[..n as usize]).unwrap();
//!             }
//!         }
//!     }).unwrap();
//!
//!     // ... later:
//!     io.stop();
//! }
//! ```
//!
//! ## Layers
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  hook / net: POSIX-shaped calls that park     │
//! │  the calling fiber on EAGAIN                  │
//! └───────────────────────────────────────────────┘
//!                      │
//! ┌───────────────────────────────────────────────┐
//! │  IoScheduler: epoll reactor + timer set as    │
//! │  the scheduler's idle fiber                   │
//! └───────────────────────────────────────────────┘
//!                      │
//! ┌───────────────────────────────────────────────┐
//! │  Scheduler: FIFO task queue over N workers    │
//! │  Fiber: stackful context, resume/yield/reset  │
//! └───────────────────────────────────────────────┘
//! ```

// Core types
pub use weft_core::{env_get, env_get_bool, FiberId, FiberState, WeftError, WeftResult};

// Logging macros re-exported at the facade root
pub use weft_core::{wdebug, werror, winfo, wtrace, wwarn};
pub use weft_core::log::{self, Level};

// Execution core
pub use weft_runtime::scheduler::{Schedule, ScheduleTask, Scheduler, Task};
pub use weft_runtime::{
    current_name, current_tid, now_ms, Fiber, FiberFn, Semaphore, Timer, TimerManager,
    WorkerThread, DEFAULT_STACK_SIZE, NO_TIMEOUT,
};

// IO layer
pub use weft_io::{
    connect_timeout_ms, set_connect_timeout_ms, set_hook_enabled, FdCtx, FdManager, IoEvent,
    IoScheduler, TcpListener, TcpStream, TimeoutKind,
};

/// The hooked POSIX surface (`weft::hook::read`, `weft::hook::connect`, …)
pub use weft_io::hook;

/// Id of the fiber the caller is running on; the all-ones sentinel when
/// called outside any fiber.
#[inline]
pub fn fiber_id() -> u64 {
    Fiber::fiber_id()
}
