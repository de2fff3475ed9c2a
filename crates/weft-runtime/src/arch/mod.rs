//! Architecture-specific context switching
//!
//! Each backend provides `SavedRegs`, `init_context` and `context_switch`
//! with identical signatures. The switch saves the callee-saved register
//! set and jumps; it never touches the heap and is safe to run on any
//! thread, provided a given `SavedRegs` is live on one thread at a time.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64 as current;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64 as current;
    } else {
        compile_error!("weft: unsupported architecture (x86_64 and aarch64 only)");
    }
}

pub use current::{context_switch, init_context, SavedRegs};
