// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! coio runtime: cooperative fibers with blocking-style I/O.
//!
//! Application code calls `read`, `write`, `connect_tcp` and friends as if
//! they blocked. Underneath, the calling fiber parks on its descriptor and
//! a single dispatcher decides, step by step, which fiber runs next: newly
//! spawned work first (newest first), then whichever descriptor the epoll
//! poller reports ready. Exactly one fiber runs at a time.
//!
//! Components:
//! - `fiber`    - fiber capability trait + thread-backed implementation
//! - `poller`   - readiness multiplexer trait + one-shot epoll poller
//! - `registry` - open handles and their single waiting fiber
//! - `dispatch` - the per-step scheduling decision
//! - `context`  - scheduler context, `Co` handle, spawn
//! - `io`       - blocking-style primitives
//! - `runtime`  - bootstrap and the run loop
//!
//! ```no_run
//! use coio_rt::{Runtime, RuntimeConfig};
//!
//! Runtime::new(RuntimeConfig::default())?.run(|co| {
//!     let conn = co.connect_tcp("127.0.0.1", 9000).expect("connect");
//!     co.write_all(conn, b"ping").expect("write");
//!     co.close(conn);
//! })?;
//! # Ok::<(), coio_rt::CoError>(())
//! ```

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod fiber;
pub mod io;
mod net;
pub mod poller;
pub mod registry;
pub mod runtime;

pub use config::RuntimeConfig;
pub use context::Co;
pub use error::{CoError, ContractViolation};
pub use fiber::{FiberCapability, FiberId, ThreadFibers};
pub use io::OpenMode;
pub use poller::{EpollPoller, Interest, Multiplexer, Readiness};
pub use registry::Handle;
pub use runtime::Runtime;
