//! # Multiplexer — two implementations, one contract
//!
//! The engine waits for OS I/O notifications and turns them into operation
//! completions. Two structurally different notification models hide behind
//! the same inherent API, selected at build time:
//!
//! - readiness (default): epoll. Registration means "notify me when I can
//!   try the call"; the head operation attempts the real transfer on each
//!   notification and stays queued while the call reports not-ready.
//! - completion (`uring` feature): io_uring. Issuing the request *is* the
//!   native call; the CQE later carries the status and byte count.
//!
//! Both expose: `bind` / `unbind`, `submit`, `post` / `poster()`,
//! `run_once(timeout) -> processed`, `run()` (blocks until no descriptors
//! are registered and the active-link counter is zero), `drain`, and the
//! active-link counter. Nothing outside this module depends on which
//! implementation is active.

mod shared;
mod wake;

pub use shared::Poster;

cfg_if::cfg_if! {
    if #[cfg(feature = "uring")] {
        mod completion;
        pub use completion::CompletionMux as Multiplexer;
    } else {
        mod readiness;
        pub use readiness::ReadinessMux as Multiplexer;
    }
}
