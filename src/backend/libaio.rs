//! Legacy native-AIO backend (`io_setup`/`io_submit`/`io_getevents`).
//!
//! Bindings are raw syscalls: libc exposes the syscall numbers but not the
//! control-block layout, so the kernel ABI structs are declared here.

#![cfg(target_os = "linux")]

use std::io;
use std::mem;

use libc::c_long;

use crate::backend::{AioBackend, SubmitError, SubmitErrorKind};
use crate::constants::REAP_WAIT;
use crate::task::{Direction, IoTask};

#[cfg(not(target_endian = "little"))]
compile_error!("iocb field order below is the little-endian kernel layout");

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// Kernel I/O control block (`struct iocb` from `<linux/aio_abi.h>`).
#[repr(C)]
struct Iocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// Kernel completion record (`struct io_event`).
#[repr(C)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

const _: () = assert!(mem::size_of::<Iocb>() == 64);
const _: () = assert!(mem::size_of::<IoEvent>() == 32);

/// Context-based backend. The maximum number of concurrent operations is
/// fixed at `io_setup` time; the kernel reports `EAGAIN` when it is reached.
///
/// The context handle is just an id — `io_submit` and `io_getevents` are
/// synchronized by the kernel, so concurrent submit/reap needs no userspace
/// locking.
pub struct LibaioBackend {
    ctx: AioContext,
}

impl LibaioBackend {
    /// Creates a context allowing up to `depth` concurrent operations.
    pub fn new(depth: u32) -> io::Result<Self> {
        let mut ctx: AioContext = 0;
        // SAFETY: io_setup writes the new context id into `ctx`.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                depth as c_long,
                &mut ctx as *mut AioContext,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ctx })
    }
}

impl AioBackend for LibaioBackend {
    fn submit(&self, task: Box<IoTask>) -> Result<(), SubmitError> {
        let opcode = match task.direction {
            Direction::Read => IOCB_CMD_PREAD,
            Direction::Write => IOCB_CMD_PWRITE,
        };
        let buf = task.buf.as_mut_ptr();
        let nbytes = task.buf.len() as u64;
        let fildes = task.fd as u32;
        let offset = task.offset as i64;

        let raw = Box::into_raw(task);
        let cb = Box::into_raw(Box::new(Iocb {
            aio_data: raw as u64,
            aio_key: 0,
            aio_rw_flags: 0,
            aio_lio_opcode: opcode,
            aio_reqprio: 0,
            aio_fildes: fildes,
            aio_buf: buf as u64,
            aio_nbytes: nbytes,
            aio_offset: offset,
            aio_reserved2: 0,
            aio_flags: 0,
            aio_resfd: 0,
        }));

        let mut list = [cb];
        // SAFETY: `list` holds one valid control block; the kernel either
        // accepts it (rc == 1) or takes nothing (rc < 0).
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                1 as c_long,
                list.as_mut_ptr(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: the kernel rejected the batch; both allocations are ours
            // again and were never aliased.
            unsafe {
                drop(Box::from_raw(cb));
            }
            let task = unsafe { Box::from_raw(raw) };

            let kind = match err.raw_os_error() {
                Some(libc::EAGAIN) => SubmitErrorKind::QueueFull,
                Some(errno) => SubmitErrorKind::Os(errno),
                None => SubmitErrorKind::Os(libc::EIO),
            };
            return Err(SubmitError::new(kind, task));
        }
        assert!(rc == 1);

        Ok(())
    }

    fn reap(&self) -> Option<Box<IoTask>> {
        let mut event = IoEvent {
            data: 0,
            obj: 0,
            res: 0,
            res2: 0,
        };
        let mut timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: REAP_WAIT.as_nanos() as c_long,
        };

        // SAFETY: `event` provides room for one record; the timeout bounds
        // the wait so cancellation stays responsive.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.ctx,
                1 as c_long,
                1 as c_long,
                &mut event as *mut IoEvent,
                &mut timeout as *mut libc::timespec,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                log::error!("io_getevents failed: {err}");
            }
            return None;
        }
        if rc == 0 {
            return None;
        }
        assert!(rc == 1);

        let cb = event.obj as *mut Iocb;
        assert!(!cb.is_null());
        // SAFETY: `obj` is the control block passed to io_submit; its
        // `aio_data` must round-trip to the same task pointer.
        unsafe {
            assert!((*cb).aio_data == event.data);
            drop(Box::from_raw(cb));
        }

        assert!(event.data != 0);
        // SAFETY: `data` is the raw task pointer stored at submission; the
        // kernel reports each completion exactly once.
        let mut task = unsafe { Box::from_raw(event.data as *mut IoTask) };
        task.result = event.res as i32;
        Some(task)
    }
}

impl Drop for LibaioBackend {
    fn drop(&mut self) {
        // SAFETY: `ctx` came from io_setup and is destroyed exactly once.
        let rc = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
        if rc < 0 {
            log::error!("io_destroy failed: {}", io::Error::last_os_error());
        }
    }
}
