//! Feeds pending tasks into the backend, in order, forever retrying.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::backend::AioBackend;
use crate::constants::POLL_INTERVAL;
use crate::task::IoTask;

struct Shared {
    backend: Arc<dyn AioBackend>,
    /// Unbounded on purpose: enqueue never blocks and never rejects. Under
    /// sustained overload this grows without limit — a known scalability
    /// boundary of the design.
    pending: Mutex<VecDeque<Box<IoTask>>>,
    stop: AtomicBool,
}

/// Cloneable producer handle. Completion callbacks capture one of these to
/// re-enqueue a re-armed task.
#[derive(Clone)]
pub struct SubmitHandle {
    shared: Arc<Shared>,
}

impl SubmitHandle {
    /// Appends a task at the queue tail. Never blocks, never rejects.
    pub fn enqueue(&self, task: Box<IoTask>) {
        self.shared.pending.lock().push_back(task);
    }

    /// Number of tasks waiting for submission. Diagnostic only; stale the
    /// moment it returns.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

/// Owns the pending queue and the background submission thread.
///
/// Tasks enqueued by a single producer reach the backend in FIFO order: the
/// loop pops the head, and a rejected submission goes back to the *front* of
/// the queue (producers only ever append at the tail), so the head keeps its
/// position across any number of retries.
pub struct Submitter {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Submitter {
    /// Spawns the submission thread over `backend`.
    pub fn spawn(backend: Arc<dyn AioBackend>) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            backend,
            pending: Mutex::new(VecDeque::new()),
            stop: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("aio-submitter".into())
            .spawn(move || Self::run(&thread_shared))?;

        log::debug!("submitter thread started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Returns a producer handle bound to this submitter's queue.
    pub fn handle(&self) -> SubmitHandle {
        SubmitHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn run(shared: &Shared) {
        loop {
            // Cancellation is observed here, outside the queue lock and
            // outside any backend call.
            if shared.stop.load(Ordering::Acquire) {
                break;
            }

            let task = shared.pending.lock().pop_front();
            let Some(task) = task else {
                thread::sleep(POLL_INTERVAL);
                continue;
            };

            match shared.backend.submit(task) {
                Ok(()) => {}
                Err(err) => {
                    // Transient backpressure, never fatal: the task returns to
                    // the head and is retried indefinitely.
                    log::warn!("submission rejected ({}), retrying", err.kind());
                    shared.pending.lock().push_front(err.into_task());
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }

        let abandoned = shared.pending.lock().len();
        if abandoned > 0 {
            log::debug!("submitter exiting, dropping {abandoned} queued tasks");
        }
    }

    /// Signals cancellation and joins the thread. Tasks still queued are
    /// dropped; this is a process-teardown path, not a steady-state one.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("submitter thread panicked");
            }
        }
    }
}

impl Drop for Submitter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
