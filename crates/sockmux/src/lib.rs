//! # sockmux — asynchronous socket I/O engine
//!
//! A uniform single-threaded abstraction over two OS notification models:
//! readiness (epoll, default) and completion (io_uring, `uring` feature).
//! Callers open descriptors through a service, queue asynchronous
//! operations with single-shot handlers, and drive everything from one
//! thread via [`Engine::run`].
//!
//! ```no_run
//! use sockmux::{Buffer, Engine};
//!
//! let engine = Engine::new().unwrap();
//! let tcp = engine.tcp().clone();
//! let h = tcp.open(libc::AF_INET).unwrap();
//! tcp.set_nonblocking(&h, true).unwrap();
//! tcp.async_connect(
//!     &h,
//!     sockmux::Address::v4([127, 0, 0, 1], 7000),
//!     Box::new(move |res| println!("connected: {:?}", res)),
//! );
//! engine.run();
//! ```
//!
//! Handlers always execute on the driving thread. Other threads interact
//! with a running engine only through [`Engine::poster`].

pub mod addr;
pub mod descriptor;
pub mod engine;
pub mod mux;
mod op;
pub mod service;
pub mod timer;

pub use addr::Address;
pub use descriptor::Descriptor;
pub use engine::Engine;
pub use mux::{Multiplexer, Poster};
pub use op::{AcceptHandler, ConnectHandler, IoHandler, RecvFromHandler};
pub use service::{Shutdown, TcpService, UdpService};
pub use timer::{Timer, TimerService};

pub use sockmux_core::{Buffer, MuxError, MuxResult};
