//! # sockmux-core — leaf types shared by the sockmux engine
//!
//! Deliberately small: the portable error model, the non-owning
//! [`Buffer`] view used by every transfer, and the kernel-style
//! logging macros. Nothing in here touches a multiplexer.

pub mod buffer;
pub mod error;
pub mod kprint;

pub use buffer::Buffer;
pub use error::{MuxError, MuxResult};
