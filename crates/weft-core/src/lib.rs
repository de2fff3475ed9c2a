//! # weft-core
//!
//! Shared leaf types for the weft fiber runtime: fiber identifiers and
//! states, the runtime error type, environment helpers, and the `w*!`
//! logging macros. Everything here is dependency-light so the runtime and
//! io crates can both sit on top of it.

pub mod env;
pub mod error;
pub mod id;
pub mod log;
pub mod state;

pub use env::{env_get, env_get_bool};
pub use error::{WeftError, WeftResult};
pub use id::FiberId;
pub use state::FiberState;
