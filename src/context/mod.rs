//! Per-worker state: one ring, one op slab, one buffer ring, one scheduler.
//!
//! Everything here is strictly thread-local. Rather than lazily constructed
//! per-thread singletons, the pieces are grouped into one explicit context so
//! initialization order (ring before buffer registration) and teardown are
//! deterministic, and so nothing is shared across workers by accident.

use crate::runtime::executor::Scheduler;
use crate::runtime::Config;
use anyhow::{anyhow, Result};
use std::cell::{OnceCell, RefCell};
use std::thread_local;

pub(crate) mod buf_ring;
pub(crate) use buf_ring::{BorrowedBuf, BufRing, BUFFER_GROUP_ID};

pub(crate) mod ring;
pub(crate) use ring::Ring;

pub(crate) mod slab;
pub(crate) use slab::OpSlab;

pub(crate) struct WorkerContext {
    // Field order is drop order: the ring must close first so the kernel
    // quiesces in-flight ops before descriptors, buffer memory, and the
    // futures that own op payloads are freed.
    ring: RefCell<Ring>,
    ops: RefCell<OpSlab>,
    buffers: RefCell<BufRing>,
    scheduler: RefCell<Scheduler>,
}

thread_local! {
    static CONTEXT: OnceCell<WorkerContext> = const { OnceCell::new() };
}

/// Initializes this thread's worker context. Called once by the runtime
/// builder; a second runtime on the same thread is refused.
pub(crate) fn init(cfg: &Config) -> Result<()> {
    CONTEXT.with(|cell| {
        if cell.get().is_some() {
            return Err(anyhow!("a runtime is already active on this thread"));
        }

        let ring = Ring::try_new(cfg.sq_entries)?;
        let mut buffers = BufRing::try_new(cfg.buffer_entries, cfg.buffer_size)?;
        buffers.register(&ring)?;

        // The slab mirrors the CQ ring, which io_uring sizes at twice the SQ
        // ring: multishot ops can have more completions pending than
        // submissions outstanding.
        let ops = OpSlab::new(cfg.sq_entries as usize * 2);

        let _ = cell.set(WorkerContext {
            ring: RefCell::new(ring),
            ops: RefCell::new(ops),
            buffers: RefCell::new(buffers),
            scheduler: RefCell::new(Scheduler::new()),
        });

        Ok(())
    })
}

#[inline(always)]
fn with_context<F, R>(f: F) -> R
where
    F: FnOnce(&WorkerContext) -> R,
{
    CONTEXT.with(|cell| {
        let ctx = cell
            .get()
            .expect("worker context not initialized on this thread");
        f(ctx)
    })
}

#[inline(always)]
pub(crate) fn with_ring_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut Ring) -> R,
{
    with_context(|ctx| f(&mut ctx.ring.borrow_mut()))
}

#[inline(always)]
pub(crate) fn with_ops_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut OpSlab) -> R,
{
    with_context(|ctx| f(&mut ctx.ops.borrow_mut()))
}

#[inline(always)]
pub(crate) fn with_ops_and_ring_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut OpSlab, &mut Ring) -> R,
{
    with_context(|ctx| {
        let mut ops = ctx.ops.borrow_mut();
        let mut ring = ctx.ring.borrow_mut();
        f(&mut ops, &mut ring)
    })
}

#[inline(always)]
pub(crate) fn with_buffers_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut BufRing) -> R,
{
    with_context(|ctx| f(&mut ctx.buffers.borrow_mut()))
}

/// Like [`with_buffers_mut`] but a no-op when the context is gone. Used from
/// destructors that may run during thread teardown.
pub(crate) fn try_with_buffers_mut<F>(f: F)
where
    F: FnOnce(&mut BufRing),
{
    let _ = CONTEXT.try_with(|cell| {
        if let Some(ctx) = cell.get() {
            f(&mut ctx.buffers.borrow_mut());
        }
    });
}

/// Like [`with_ops_and_ring_mut`] but a no-op when the context is gone. Used
/// by op destructors, which may run while the worker is unwinding.
pub(crate) fn try_with_ops_and_ring_mut<F>(f: F)
where
    F: FnOnce(&mut OpSlab, &mut Ring),
{
    let _ = CONTEXT.try_with(|cell| {
        if let Some(ctx) = cell.get() {
            let mut ops = ctx.ops.borrow_mut();
            let mut ring = ctx.ring.borrow_mut();
            f(&mut ops, &mut ring);
        }
    });
}

#[inline(always)]
pub(crate) fn with_scheduler_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut Scheduler) -> R,
{
    with_context(|ctx| f(&mut ctx.scheduler.borrow_mut()))
}

/// Size of each receive buffer; recv ops ask for exactly one buffer's worth.
pub(crate) fn buffer_size() -> usize {
    with_buffers_mut(|buffers| buffers.buf_size())
}

/// Borrow the buffer the kernel selected for a recv completion.
pub(crate) fn borrow_buffer(bid: u16, len: usize) -> BorrowedBuf {
    with_buffers_mut(|buffers| buffers.borrow(bid, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::test_utils::init_test_runtime;
    use std::thread;

    #[test]
    fn test_second_runtime_on_same_thread_is_refused() {
        let _rt = init_test_runtime();
        assert!(Builder::new().try_build().is_err());
    }

    #[test]
    fn test_context_is_thread_local() {
        let _rt = init_test_runtime();

        let sq_len = with_ring_mut(|ring| ring.sq_capacity());

        let handle = thread::spawn(move || {
            let _rt = Builder::new()
                .sq_entries(
                    u32::try_from(sq_len * 2).expect("sq capacity fits in u32"),
                )
                .try_build()
                .unwrap();

            with_ring_mut(|ring| ring.sq_capacity())
        });

        let other = handle.join().unwrap();
        assert_eq!(other, sq_len * 2);

        // This thread's ring is untouched.
        assert_eq!(with_ring_mut(|ring| ring.sq_capacity()), sq_len);
    }
}
