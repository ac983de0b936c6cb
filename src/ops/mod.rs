//! Awaitable kernel operations.
//!
//! Each op is a one-shot future (or a stream, for multishot accept) over a
//! payload that knows how to build its submission entry and type its raw
//! completion. Suspension stores the task's waker in the op's slab
//! descriptor; the dispatch side of the event loop resumes it with the
//! recorded result and flags.

use crate::context;
use crate::context::slab::{CancelDisposition, Completion, OpResult};
use io_uring::squeue::Entry;
use pin_project::{pin_project, pinned_drop};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pub(crate) mod errors;
pub use errors::IoError;

pub(crate) mod single;
pub(crate) use single::{CancelOp, RecvOp, RecvOutcome, SendOp, SpliceOp};

pub(crate) mod multishot;
pub(crate) use multishot::{AcceptMultishot, Multishot};

/// A one-shot op payload: builds the submission entry, then turns the raw
/// completion into a typed output.
pub(crate) trait OpPayload {
    type Output;

    fn build_entry(self: Pin<&mut Self>) -> Entry;

    fn into_output(self: Pin<&mut Self>, result: OpResult) -> Result<Self::Output, IoError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpState {
    Unsubmitted,
    Submitted { idx: usize },
    Completed,
}

/// Reserve a descriptor and push `entry` with the descriptor index as its
/// user-data. The reservation is backed out if the push fails, so slab and
/// ring cannot go out of sync.
pub(crate) fn submit(entry: Entry, completion: Completion) -> Result<usize, IoError> {
    context::with_ops_and_ring_mut(|ops, ring| {
        let idx = ops.insert(completion)?;
        let entry = entry.user_data(idx as u64);

        match ring.push(&entry) {
            Ok(()) => {
                ops.note_submitted();
                Ok(idx)
            }
            Err(e) => {
                ops.abort(idx);
                Err(e)
            }
        }
    })
}

/// Detach descriptor `idx` from its dropped future and ask the kernel to
/// cancel the op. The reaper descriptor outlives the future and frees both
/// slots once the cancel's own completion is observed; if the op completes
/// normally before the cancel lands, that completion is discarded without
/// resuming anyone.
pub(crate) fn cancel_in_flight(idx: usize) {
    context::try_with_ops_and_ring_mut(|ops, ring| {
        if ops.mark_cancelled(idx) != CancelDisposition::NeedsCancel {
            return;
        }

        let reaper = match ops.insert(Completion::reap(idx)) {
            Ok(reaper) => reaper,
            Err(e) => {
                // The descriptor stays cancelled in place and frees itself on
                // its final completion.
                tracing::error!(idx, error = %e, "no descriptor slot for async cancel");
                return;
            }
        };

        let entry = io_uring::opcode::AsyncCancel::new(idx as u64)
            .build()
            .user_data(reaper as u64);

        match ring.push(&entry) {
            Ok(()) => ops.note_submitted(),
            Err(e) => {
                ops.abort(reaper);
                tracing::error!(idx, error = %e, "failed to push async cancel");
            }
        }
    });
}

/// One-shot awaitable over an [`OpPayload`].
///
/// Never ready before its kernel completion: the first poll submits and
/// suspends, the resuming poll reads the recorded result and produces the
/// typed output. Dropping it mid-flight triggers [`cancel_in_flight`].
#[pin_project(PinnedDrop)]
pub(crate) struct Op<T: OpPayload> {
    state: OpState,

    #[pin]
    payload: T,

    // The descriptor index refers to this thread's slab.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl<T: OpPayload> Op<T> {
    pub(crate) fn new(payload: T) -> Self {
        Self {
            state: OpState::Unsubmitted,
            payload,
            _not_send: std::marker::PhantomData,
        }
    }
}

impl<T: OpPayload> Future for Op<T> {
    type Output = Result<T::Output, IoError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        match *this.state {
            OpState::Unsubmitted => {
                let entry = this.payload.as_mut().build_entry();

                match submit(entry, Completion::single()) {
                    Ok(idx) => {
                        *this.state = OpState::Submitted { idx };
                        context::with_ops_mut(|ops| ops.set_waker(idx, cx.waker()));
                        Poll::Pending
                    }
                    Err(e) if e.is_fatal() => {
                        // Submission capacity is a deployment parameter; there
                        // is no recovery path once it is exhausted.
                        panic!("worker out of submission capacity: {}", e);
                    }
                    Err(e) => {
                        *this.state = OpState::Completed;
                        Poll::Ready(Err(e))
                    }
                }
            }
            OpState::Submitted { idx } => {
                let result = context::with_ops_mut(|ops| match ops.take_result(idx) {
                    Some(result) => Some(result),
                    None => {
                        ops.set_waker(idx, cx.waker());
                        None
                    }
                });

                match result {
                    Some(result) => {
                        *this.state = OpState::Completed;
                        Poll::Ready(this.payload.into_output(result))
                    }
                    None => Poll::Pending,
                }
            }
            OpState::Completed => panic!("op future polled after completion"),
        }
    }
}

#[pinned_drop]
impl<T: OpPayload> PinnedDrop for Op<T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();

        if let OpState::Submitted { idx } = this.state {
            cancel_in_flight(*idx);
        }
    }
}
