//! `io_uring` backend: shared submission/completion rings.

#![cfg(target_os = "linux")]

use std::io;

use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;

use crate::backend::{AioBackend, SubmitError, SubmitErrorKind};
use crate::task::{Direction, IoTask};

/// Ring-based backend. Ring capacity (queue depth) is fixed at construction.
///
/// The submitter and reaper threads touch disjoint halves of the ring, so the
/// submission and completion queues are guarded by two independent locks and
/// `submit`/`reap` interleave freely.
pub struct UringBackend {
    ring: IoUring,
    sq_lock: Mutex<()>,
    cq_lock: Mutex<()>,
}

impl UringBackend {
    /// Initializes a ring with `entries` submission slots.
    pub fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries)?;
        Ok(Self {
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
        })
    }

    fn prep(task: &IoTask) -> squeue::Entry {
        let fd = types::Fd(task.fd);
        let len = task.buf.len() as u32;
        match task.direction {
            Direction::Read => opcode::Read::new(fd, task.buf.as_mut_ptr(), len)
                .offset(task.offset)
                .build(),
            Direction::Write => opcode::Write::new(fd, task.buf.as_ptr(), len)
                .offset(task.offset)
                .build(),
        }
    }
}

impl AioBackend for UringBackend {
    fn submit(&self, task: Box<IoTask>) -> Result<(), SubmitError> {
        let entry = Self::prep(&task);
        let raw = Box::into_raw(task);
        let entry = entry.user_data(raw as u64);

        {
            let _guard = self.sq_lock.lock();
            // SAFETY: sq_lock serializes all submission-queue access.
            let mut sq = unsafe { self.ring.submission_shared() };
            // SAFETY: the buffer lives inside the task allocation, which stays
            // alive (behind `raw`) until reap reconstructs the box.
            if unsafe { sq.push(&entry) }.is_err() {
                drop(sq);
                // SAFETY: `raw` came from Box::into_raw above and was never
                // handed to the kernel.
                let task = unsafe { Box::from_raw(raw) };
                return Err(SubmitError::new(SubmitErrorKind::QueueFull, task));
            }
            sq.sync();
        }

        // The entry is already in the ring; a failed kick leaves it queued and
        // the next submission carries it into the kernel.
        if let Err(err) = self.ring.submit() {
            log::error!("io_uring_enter failed: {err}");
        }

        Ok(())
    }

    fn reap(&self) -> Option<Box<IoTask>> {
        let (user_data, result) = {
            let _guard = self.cq_lock.lock();
            // SAFETY: cq_lock serializes all completion-queue access.
            let mut cq = unsafe { self.ring.completion_shared() };
            cq.sync();
            let cqe = cq.next()?;
            (cqe.user_data(), cqe.result())
            // Dropping `cq` publishes the advanced head; the entry is consumed.
        };

        assert!(user_data != 0);
        // SAFETY: user_data was produced by Box::into_raw in submit and is
        // surfaced by the kernel exactly once.
        let mut task = unsafe { Box::from_raw(user_data as *mut IoTask) };
        task.result = result;
        Some(task)
    }
}
