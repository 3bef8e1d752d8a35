//! Kernel asynchronous-I/O backends.
//!
//! Two interchangeable variants sit behind the [`AioBackend`] trait:
//!
//! - [`UringBackend`]: `io_uring` submission/completion rings
//! - [`LibaioBackend`]: the legacy native-AIO context (`io_setup` family)
//!
//! Both uphold the same hand-off contract. [`submit`](AioBackend::submit)
//! either fully transfers the task to the kernel — the backend will not touch
//! it again until it surfaces through [`reap`](AioBackend::reap) — or fails
//! and returns the task unmodified inside the error, so the caller can retry
//! or requeue without corruption. `reap` returns each completed task exactly
//! once and never a task it did not itself accept.
//!
//! `submit` and `reap` are called concurrently from the submitter and reaper
//! threads on the same instance; any synchronization they need is internal.

#[cfg(target_os = "linux")]
mod libaio;
#[cfg(target_os = "linux")]
mod uring;

#[cfg(not(target_os = "linux"))]
compile_error!("This crate targets Linux kernel AIO (io_uring / native AIO) only.");

use std::io;
use std::sync::Arc;

#[cfg(target_os = "linux")]
pub use libaio::LibaioBackend;
#[cfg(target_os = "linux")]
pub use uring::UringBackend;

use crate::constants::{QUEUE_DEPTH_MAX, QUEUE_DEPTH_MIN};
use crate::task::IoTask;

/// Backend selection, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// `io_uring` rings. Preferred on kernels ≥ 5.1.
    Uring,
    /// Legacy native AIO (`io_setup`/`io_submit`/`io_getevents`).
    Libaio,
}

/// Why a submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitErrorKind {
    /// The backend is at its queue-depth capacity. Transient; retry after
    /// completions drain.
    #[error("submission queue full")]
    QueueFull,
    /// The kernel refused the submission outright.
    #[error("submit failed: errno {0}")]
    Os(i32),
}

/// A rejected submission. Carries the untouched task back to the caller so a
/// failed hand-off can never lose or alias it.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct SubmitError {
    kind: SubmitErrorKind,
    task: Box<IoTask>,
}

impl SubmitError {
    /// Wraps a rejected task. Public so out-of-crate [`AioBackend`]
    /// implementations (test doubles included) can uphold the same contract.
    pub fn new(kind: SubmitErrorKind, task: Box<IoTask>) -> Self {
        Self { kind, task }
    }

    #[inline]
    pub fn kind(&self) -> SubmitErrorKind {
        self.kind
    }

    /// Recovers ownership of the rejected task.
    #[inline]
    pub fn into_task(self) -> Box<IoTask> {
        self.task
    }
}

/// Submit/reap capability over a kernel AIO facility.
pub trait AioBackend: Send + Sync {
    /// Hands one task to the kernel, or returns it untouched on failure.
    fn submit(&self, task: Box<IoTask>) -> Result<(), SubmitError>;

    /// Non-blocking (or bounded-wait) poll for one completed task. The
    /// returned task has `result` populated: bytes transferred on success,
    /// negated errno on failure.
    fn reap(&self) -> Option<Box<IoTask>>;
}

/// Constructs the selected backend with a fixed queue-depth capacity.
///
/// Fails loudly when the kernel facility is unavailable or resource limits
/// are hit; an engine must never run on a half-initialized backend.
///
/// # Panics
///
/// Panics if `queue_depth` is outside
/// [`QUEUE_DEPTH_MIN`]..=[`QUEUE_DEPTH_MAX`]; the engine front-end validates
/// configuration before calling here.
#[cfg(target_os = "linux")]
pub fn open(kind: EngineKind, queue_depth: u32) -> io::Result<Arc<dyn AioBackend>> {
    assert!(queue_depth >= QUEUE_DEPTH_MIN);
    assert!(queue_depth <= QUEUE_DEPTH_MAX);

    match kind {
        EngineKind::Uring => Ok(Arc::new(UringBackend::new(queue_depth)?)),
        EngineKind::Libaio => Ok(Arc::new(LibaioBackend::new(queue_depth)?)),
    }
}
