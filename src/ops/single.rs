use crate::context::slab::OpResult;
use crate::context::BUFFER_GROUP_ID;
use crate::ops::{IoError, OpPayload};
use io_uring::squeue::Entry;
use io_uring::types::Fd;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;

fn check(res: i32) -> Result<i32, IoError> {
    if res < 0 {
        Err(IoError::Io(io::Error::from_raw_os_error(-res)))
    } else {
        Ok(res)
    }
}

///
/// === Recv ===
///
/// Buffer-select recv: no buffer is bound at submission time; the kernel
/// picks one from the worker's registered buffer group at completion time
/// and reports its id in the CQE flags.
#[derive(Debug)]
pub(crate) struct RecvOp {
    fd: RawFd,
    len: u32,
}

impl RecvOp {
    pub(crate) fn new(fd: RawFd, len: u32) -> Self {
        Self { fd, len }
    }
}

/// Typed result of a recv: either the kernel filled a pool buffer, or the
/// peer performed an orderly shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvOutcome {
    Data { bid: u16, len: usize },
    Closed,
}

impl OpPayload for RecvOp {
    type Output = RecvOutcome;

    fn build_entry(self: Pin<&mut Self>) -> Entry {
        io_uring::opcode::Recv::new(Fd(self.fd), std::ptr::null_mut(), self.len)
            .buf_group(BUFFER_GROUP_ID)
            .build()
            .flags(io_uring::squeue::Flags::BUFFER_SELECT)
    }

    fn into_output(self: Pin<&mut Self>, result: OpResult) -> Result<Self::Output, IoError> {
        let len = check(result.res)? as usize;

        match io_uring::cqueue::buffer_select(result.flags) {
            Some(bid) => Ok(RecvOutcome::Data { bid, len }),
            // A zero-byte recv may complete without consuming a buffer.
            None if len == 0 => Ok(RecvOutcome::Closed),
            None => Err(anyhow::anyhow!(
                "recv completed {} bytes without a selected buffer",
                len
            )
            .into()),
        }
    }
}

///
/// === Send ===
///
/// The op owns its bytes so the kernel's view of the buffer stays valid for
/// as long as the submission is in flight. A send may complete short;
/// callers loop on the remainder.
#[derive(Debug)]
pub(crate) struct SendOp {
    fd: RawFd,
    buf: Vec<u8>,
    offset: usize,
}

impl SendOp {
    pub(crate) fn new(fd: RawFd, buf: Vec<u8>) -> Self {
        Self::with_offset(fd, buf, 0)
    }

    /// Send `buf[offset..]`, for resuming a short send without copying.
    pub(crate) fn with_offset(fd: RawFd, buf: Vec<u8>, offset: usize) -> Self {
        debug_assert!(offset < buf.len());
        Self { fd, buf, offset }
    }
}

impl OpPayload for SendOp {
    /// Bytes sent, plus the buffer handed back so a short send can resume
    /// from the new offset without copying.
    type Output = (usize, Vec<u8>);

    fn build_entry(self: Pin<&mut Self>) -> Entry {
        let remaining = &self.buf[self.offset..];
        io_uring::opcode::Send::new(Fd(self.fd), remaining.as_ptr(), remaining.len() as u32)
            .build()
    }

    fn into_output(self: Pin<&mut Self>, result: OpResult) -> Result<Self::Output, IoError> {
        let sent = check(result.res)? as usize;

        // The kernel is done with the memory once the completion has landed.
        let this = self.get_mut();
        Ok((sent, std::mem::take(&mut this.buf)))
    }
}

///
/// === Splice ===
///
/// Moves up to `len` bytes between two descriptors without copying through
/// user space. One side must be a pipe; both offsets are left at -1 so each
/// fd's own cursor advances.
#[derive(Debug)]
pub(crate) struct SpliceOp {
    fd_in: RawFd,
    fd_out: RawFd,
    len: u32,
}

impl SpliceOp {
    pub(crate) fn new(fd_in: RawFd, fd_out: RawFd, len: u32) -> Self {
        Self { fd_in, fd_out, len }
    }
}

impl OpPayload for SpliceOp {
    type Output = usize;

    fn build_entry(self: Pin<&mut Self>) -> Entry {
        io_uring::opcode::Splice::new(Fd(self.fd_in), -1, Fd(self.fd_out), -1, self.len).build()
    }

    fn into_output(self: Pin<&mut Self>, result: OpResult) -> Result<Self::Output, IoError> {
        check(result.res).map(|moved| moved as usize)
    }
}

///
/// === Cancel ===
///
/// Asks the kernel to cancel the op identified by a previously submitted
/// descriptor index. Resolves to the raw kernel result: 0 when the target
/// was found and cancelled, -ENOENT when it no longer exists, -EALREADY when
/// it is past the point of no return.
#[derive(Debug)]
pub(crate) struct CancelOp {
    target: u64,
}

impl CancelOp {
    pub(crate) fn new(target: u64) -> Self {
        Self { target }
    }
}

impl OpPayload for CancelOp {
    type Output = i32;

    fn build_entry(self: Pin<&mut Self>) -> Entry {
        io_uring::opcode::AsyncCancel::new(self.target).build()
    }

    fn into_output(self: Pin<&mut Self>, result: OpResult) -> Result<Self::Output, IoError> {
        Ok(result.res)
    }
}
