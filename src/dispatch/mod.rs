//! The dispatch engine: submitter, reaper, and the optional callback pool.
//!
//! Thread layout:
//!
//! ```text
//! producers ──enqueue──▶ [Submitter thread] ──submit──▶ kernel backend
//!                                                            │
//! callbacks ◀─invoke── [Reaper thread] ◀────────reap─────────┘
//!      │                     │
//!      │              (optional) dispatch
//!      │                     ▼
//!      └──────────── [CallbackPool workers]
//! ```
//!
//! A callback may mutate its task and hand it back to the submitter, looping
//! the task through the pipeline again; every arrow above is an ownership
//! transfer of the boxed task.

mod pool;
mod reaper;
mod submitter;

use std::io;
use std::sync::Arc;

pub use pool::{CallbackPool, PoolConfig, PoolSaturated, SchedulePolicy};
pub use reaper::Reaper;
pub use submitter::{SubmitHandle, Submitter};

use crate::backend::{self, EngineKind};
use crate::constants::{QUEUE_DEPTH_MAX, QUEUE_DEPTH_MIN};
use crate::task::IoTask;

/// Construction-time failure. The engine is never left half-initialized:
/// any thread spawned before the failure is shut down before this returns.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The kernel AIO facility could not be initialized.
    #[error("backend initialization failed: {0}")]
    BackendInit(#[source] io::Error),
    /// A configuration value is out of range.
    #[error("invalid engine configuration: {0}")]
    Config(&'static str),
    /// The selected callback scheduling policy is not implemented.
    #[error("callback scheduling policy {0:?} is not implemented")]
    UnsupportedPolicy(SchedulePolicy),
    /// A background thread could not be spawned.
    #[error("failed to spawn engine thread: {0}")]
    Thread(#[source] io::Error),
}

/// Full engine configuration, fixed at construction. There is no runtime
/// reconfiguration surface.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Backend queue depth (maximum concurrent kernel operations).
    pub queue_depth: u32,
    /// Callback pool; `None` runs callbacks inline on the reaper thread.
    pub pool: Option<PoolConfig>,
}

/// Wires a backend, a [`Submitter`], a [`Reaper`], and optionally a
/// [`CallbackPool`] into one running engine.
pub struct Engine {
    submitter: Submitter,
    reaper: Reaper,
    pool: Option<CallbackPool>,
}

impl Engine {
    /// Validates `config`, constructs the backend, and spawns all background
    /// threads. Fails loudly; see [`EngineError`].
    pub fn start(config: &EngineConfig) -> Result<Self, EngineError> {
        if config.queue_depth < QUEUE_DEPTH_MIN || config.queue_depth > QUEUE_DEPTH_MAX {
            return Err(EngineError::Config("queue depth out of range"));
        }

        let backend =
            backend::open(config.kind, config.queue_depth).map_err(EngineError::BackendInit)?;

        let pool = match &config.pool {
            Some(pool_config) => Some(CallbackPool::start(pool_config)?),
            None => None,
        };

        let submitter = match Submitter::spawn(Arc::clone(&backend)) {
            Ok(submitter) => submitter,
            Err(err) => {
                if let Some(pool) = &pool {
                    pool.shutdown();
                }
                return Err(EngineError::Thread(err));
            }
        };
        let reaper = match Reaper::spawn(backend, pool.clone()) {
            Ok(reaper) => reaper,
            Err(err) => {
                // The submitter joins its thread on drop.
                if let Some(pool) = &pool {
                    pool.shutdown();
                }
                return Err(EngineError::Thread(err));
            }
        };

        log::debug!(
            "engine started: {:?}, queue depth {}",
            config.kind,
            config.queue_depth
        );
        Ok(Self {
            submitter,
            reaper,
            pool,
        })
    }

    /// Producer handle for enqueueing tasks; cloneable into callbacks for
    /// re-arm chains.
    pub fn handle(&self) -> SubmitHandle {
        self.submitter.handle()
    }

    /// Stops the engine: submitter first (no new submissions), then the
    /// reaper, then the pool workers. Queued and in-flight tasks are
    /// abandoned; this is a process-teardown path.
    pub fn shutdown(mut self) {
        self.submitter.shutdown();
        self.reaper.shutdown();
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
        log::debug!("engine stopped");
    }
}

/// Invokes the task's callback as final owner, or drops the task if the
/// callback was removed after the presence check.
pub(crate) fn run_callback(task: Box<IoTask>) {
    if let Some(callback) = task.callback.clone() {
        callback(task);
    }
}
