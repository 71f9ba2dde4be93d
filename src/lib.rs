//! Per-thread cooperative task runtime over pluggable OS async I/O backends.
//!
//! Tasks are plain callback frames: an entry function plus a boxed context.
//! A task never suspends implicitly — suspension is exactly the act of
//! parking a continuation against one backend operation through
//! [`Runtime::suspend`], after which the current body returns and control
//! resumes in a fresh frame when the completion arrives.
//!
//! Each thread owns an independent [`Runtime`]; the only cross-thread
//! operation is [`Waker::wake`]. The epoll backend is the reference
//! implementation of the [`AsyncIo`] contract.
//!
//! ```no_run
//! use epollo::{Builder, OpResult, Runtime, TaskMeta};
//! use std::time::Duration;
//!
//! fn tick(_rt: &Runtime, meta: &TaskMeta, _ctx: Box<()>) -> anyhow::Result<()> {
//!     assert_eq!(meta.result, OpResult::None);
//!     println!("fired");
//!     Ok(())
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let runtime = Builder::new_epoll().try_build()?;
//! runtime.spawn_delay(tick, Box::new(()), Duration::from_millis(10))?;
//! runtime.run()?;
//! # Ok(())
//! # }
//! ```

pub mod aio;
pub use aio::{AsyncIo, Completion, EpollBackend, FileStat, OpResult, Waker};

mod error;
pub use error::RuntimeError;

pub(crate) mod pool;

pub mod runtime;
pub use runtime::{Builder, Runtime};

pub(crate) mod scheduler;

mod task;
pub use task::{TaskFn, TaskIndex, TaskMeta};

#[cfg(test)]
pub(crate) mod test_utils;
