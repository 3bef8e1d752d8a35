//! Optional worker pool that executes completion callbacks off the reaper
//! thread, so one slow callback cannot stall completion delivery.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::constants::{POLL_INTERVAL, POOL_WORKERS_MAX};
use crate::dispatch::{run_callback, EngineError};
use crate::task::IoTask;

/// How completed tasks are spread across pool workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Offer each task to the workers in rotating order, taking the first
    /// free queue.
    RoundRobin,
    /// Route by file descriptor so completions for one fd stay on one worker.
    /// Recognized in the configuration surface but not implemented; selecting
    /// it fails construction.
    Hash,
}

/// Callback pool configuration, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Worker (thread) count.
    pub workers: usize,
    /// Bounded queue capacity per worker.
    pub queue_capacity: usize,
    pub policy: SchedulePolicy,
}

/// All worker queues were full. Carries the undelivered task back: the pool
/// signals rejection at its capacity boundary instead of blocking or
/// buffering beyond it, and the caller decides whether to retry, drop, or
/// block.
#[derive(Debug, thiserror::Error)]
#[error("all callback worker queues are full")]
pub struct PoolSaturated {
    task: Box<IoTask>,
}

impl PoolSaturated {
    /// Recovers ownership of the undelivered task.
    #[inline]
    pub fn into_task(self) -> Box<IoTask> {
        self.task
    }
}

struct Worker {
    index: usize,
    queue: Arc<ArrayQueue<Box<IoTask>>>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    fn spawn(index: usize, queue_capacity: usize) -> io::Result<Self> {
        let queue = Arc::new(ArrayQueue::new(queue_capacity));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_queue = Arc::clone(&queue);
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("aio-callback-{index}"))
            .spawn(move || Self::run(&thread_queue, &thread_stop))?;

        Ok(Self {
            index,
            queue,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn run(queue: &ArrayQueue<Box<IoTask>>, stop: &AtomicBool) {
        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }
            match queue.pop() {
                Some(task) => run_callback(task),
                None => thread::sleep(POLL_INTERVAL),
            }
        }

        let undelivered = queue.len();
        if undelivered > 0 {
            log::debug!("callback worker exiting, dropping {undelivered} queued callbacks");
        }
    }

    fn join(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                log::error!("callback worker {} panicked", self.index);
            }
        }
    }
}

/// Fixed set of callback workers, each with a bounded FIFO queue.
///
/// Cloning yields another handle to the same pool; the reaper keeps one for
/// dispatch while the engine keeps one for shutdown.
#[derive(Clone)]
pub struct CallbackPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for CallbackPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackPool")
            .field("workers", &self.inner.workers.len())
            .finish()
    }
}

struct PoolInner {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Last handle gone: make sure no worker thread outlives the pool.
        // Join is idempotent, so an explicit shutdown beforehand is fine.
        for worker in &self.workers {
            worker.join();
        }
    }
}

impl CallbackPool {
    /// Validates `config` and spawns the worker threads.
    pub fn start(config: &PoolConfig) -> Result<Self, EngineError> {
        if config.workers == 0 || config.workers > POOL_WORKERS_MAX {
            return Err(EngineError::Config("pool worker count out of range"));
        }
        if config.queue_capacity == 0 {
            return Err(EngineError::Config("pool queue capacity must be non-zero"));
        }
        if config.policy != SchedulePolicy::RoundRobin {
            return Err(EngineError::UnsupportedPolicy(config.policy));
        }

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker = Worker::spawn(index, config.queue_capacity).map_err(EngineError::Thread)?;
            workers.push(worker);
        }
        log::debug!(
            "callback pool started: {} workers, queue capacity {}",
            config.workers,
            config.queue_capacity
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                workers,
                next: AtomicUsize::new(0),
            }),
        })
    }

    /// Number of workers in the pool.
    pub fn workers(&self) -> usize {
        self.inner.workers.len()
    }

    /// Offers `task` to each worker once, starting at the rotation point.
    /// Returns [`PoolSaturated`] when every queue is full.
    pub fn dispatch(&self, task: Box<IoTask>) -> Result<(), PoolSaturated> {
        let n = self.inner.workers.len();
        let start = self.inner.next.fetch_add(1, Ordering::Relaxed) % n;

        let mut task = task;
        for i in 0..n {
            let worker = &self.inner.workers[(start + i) % n];
            match worker.queue.push(task) {
                Ok(()) => return Ok(()),
                Err(rejected) => task = rejected,
            }
        }
        Err(PoolSaturated { task })
    }

    /// Cancels and joins every worker. Queued-but-unexecuted callbacks are
    /// dropped.
    pub fn shutdown(&self) {
        for worker in &self.inner.workers {
            worker.join();
        }
        log::debug!("callback pool stopped");
    }
}
