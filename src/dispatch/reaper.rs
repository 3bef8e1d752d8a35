//! Drains completed tasks from the backend and delivers their callbacks.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::backend::AioBackend;
use crate::constants::POLL_INTERVAL;
use crate::dispatch::{run_callback, CallbackPool};
use crate::task::IoTask;

struct Shared {
    backend: Arc<dyn AioBackend>,
    pool: Option<CallbackPool>,
    stop: AtomicBool,
}

/// Background thread polling the backend for completions.
///
/// With no pool configured, callbacks run inline on this thread; a callback
/// that re-arms its task and re-enqueues it is the entire state machine for
/// multi-phase chains. With a pool, the completed task is forwarded and the
/// reaper immediately returns to draining the backend.
pub struct Reaper {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Reaper {
    /// Spawns the reaper thread over `backend`, delivering callbacks inline
    /// or through `pool` when one is given.
    pub fn spawn(backend: Arc<dyn AioBackend>, pool: Option<CallbackPool>) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            backend,
            pool,
            stop: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("aio-reaper".into())
            .spawn(move || Self::run(&thread_shared))?;

        log::debug!("reaper thread started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn run(shared: &Shared) {
        loop {
            // Cancellation is observed outside any backend call.
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
            match shared.backend.reap() {
                None => thread::sleep(POLL_INTERVAL),
                Some(task) => Self::deliver(shared, task),
            }
        }
    }

    fn deliver(shared: &Shared, task: Box<IoTask>) {
        if task.callback.is_none() {
            // Resources released, completion silently dropped.
            log::debug!("completion without callback dropped: {task:?}");
            return;
        }

        let Some(pool) = &shared.pool else {
            run_callback(task);
            return;
        };

        // The pool rejects at its capacity boundary; the reaper's choice is
        // to retry at the polling cadence rather than drop or block inside
        // the pool.
        let mut task = task;
        loop {
            match pool.dispatch(task) {
                Ok(()) => break,
                Err(saturated) => {
                    task = saturated.into_task();
                    if shared.stop.load(Ordering::Acquire) {
                        log::debug!("dropping completion during shutdown: {task:?}");
                        break;
                    }
                    log::warn!("callback pool saturated, retrying");
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// Signals cancellation and joins the thread. In-flight tasks whose
    /// completions were not yet reaped are abandoned to the backend.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("reaper thread panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
