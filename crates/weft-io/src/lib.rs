//! # weft-io
//!
//! The io layer of the weft fiber runtime:
//!
//! - [`reactor`] — the epoll-backed [`reactor::IoScheduler`], whose idle
//!   fiber multiplexes fd readiness and timer expiry onto the scheduler
//! - [`fd`] — the process-wide fd policy table consulted by the hooks
//! - [`hook`] — POSIX-shaped blocking-call replacements that park the
//!   calling fiber instead of the worker thread
//! - [`net`] — `TcpListener`/`TcpStream` convenience wrappers over the
//!   hooks

pub mod fd;
pub mod hook;
pub mod net;
pub mod reactor;

pub use fd::{FdCtx, FdManager, TimeoutKind};
pub use hook::{connect_timeout_ms, hook_enabled, set_connect_timeout_ms, set_hook_enabled};
pub use net::{TcpListener, TcpStream};
pub use reactor::{IoEvent, IoScheduler};
