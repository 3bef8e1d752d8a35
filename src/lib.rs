//! Asynchronous block-I/O dispatch over Linux kernel AIO backends.
//!
//! Callers build an [`task::IoTask`] describing one read or write, hand it to
//! the engine, and get their completion callback invoked once the kernel
//! finishes — without ever blocking, and without knowing whether `io_uring`
//! or legacy native AIO is underneath.

pub mod backend;
pub mod buffer;
pub mod constants;
pub mod dispatch;
pub mod task;

pub use backend::{AioBackend, EngineKind, SubmitError, SubmitErrorKind};
pub use buffer::AlignedBuf;
pub use dispatch::{
    CallbackPool, Engine, EngineConfig, EngineError, PoolConfig, PoolSaturated, Reaper,
    SchedulePolicy, SubmitHandle, Submitter,
};
pub use task::{Direction, IoTask, TaskCallback};
