use crate::context;
use crate::context::slab::{Completion, OpResult, StreamPoll};
use crate::ops::{cancel_in_flight, submit, IoError, OpState};
use futures::Stream;
use io_uring::squeue::Entry;
use io_uring::types::Fd;
use pin_project::{pin_project, pinned_drop};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A payload whose single submission yields repeated completions.
pub(crate) trait MultishotPayload {
    type Item;

    fn build_entry(self: Pin<&mut Self>) -> Entry;

    fn into_item(self: Pin<&mut Self>, result: OpResult) -> Result<Self::Item, IoError>;
}

/// Multishot accept on a listening socket: one completion per accepted
/// connection, until the kernel retires the submission.
#[derive(Debug)]
pub(crate) struct AcceptMultishot {
    fd: RawFd,
}

impl AcceptMultishot {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl MultishotPayload for AcceptMultishot {
    type Item = OwnedFd;

    fn build_entry(self: Pin<&mut Self>) -> Entry {
        io_uring::opcode::AcceptMulti::new(Fd(self.fd)).build()
    }

    fn into_item(self: Pin<&mut Self>, result: OpResult) -> Result<Self::Item, IoError> {
        if result.res < 0 {
            Err(IoError::Io(io::Error::from_raw_os_error(-result.res)))
        } else {
            // The kernel handed us a fresh connection fd; we own it from here.
            Ok(unsafe { OwnedFd::from_raw_fd(result.res) })
        }
    }
}

/// Lazy, non-restartable stream of completions from one multishot
/// submission.
///
/// The descriptor stays installed across completions: each one resumes the
/// consumer exactly once, and the same submission keeps producing until a
/// completion arrives without the MORE flag, which ends the stream. Dropping
/// the stream mid-flight cancels the submission and discards anything the
/// kernel still posts for it.
#[pin_project(PinnedDrop)]
pub(crate) struct Multishot<T: MultishotPayload> {
    state: OpState,

    #[pin]
    payload: T,

    _not_send: std::marker::PhantomData<*const ()>,
}

impl<T: MultishotPayload> Multishot<T> {
    pub(crate) fn new(payload: T) -> Self {
        Self {
            state: OpState::Unsubmitted,
            payload,
            _not_send: std::marker::PhantomData,
        }
    }
}

impl<T: MultishotPayload> Stream for Multishot<T> {
    type Item = Result<T::Item, IoError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        match *this.state {
            OpState::Unsubmitted => {
                let entry = this.payload.as_mut().build_entry();

                match submit(entry, Completion::stream()) {
                    Ok(idx) => {
                        *this.state = OpState::Submitted { idx };
                        context::with_ops_mut(|ops| ops.set_waker(idx, cx.waker()));
                        Poll::Pending
                    }
                    Err(e) if e.is_fatal() => {
                        panic!("worker out of submission capacity: {}", e);
                    }
                    Err(e) => {
                        *this.state = OpState::Completed;
                        Poll::Ready(Some(Err(e)))
                    }
                }
            }
            OpState::Submitted { idx } => {
                let polled = context::with_ops_mut(|ops| {
                    let polled = ops.pop_stream(idx);
                    if matches!(polled, StreamPoll::Pending) {
                        ops.set_waker(idx, cx.waker());
                    }
                    polled
                });

                match polled {
                    StreamPoll::Item(result) => {
                        Poll::Ready(Some(this.payload.as_mut().into_item(result)))
                    }
                    StreamPoll::Pending => Poll::Pending,
                    StreamPoll::Done => {
                        *this.state = OpState::Completed;
                        Poll::Ready(None)
                    }
                }
            }
            OpState::Completed => Poll::Ready(None),
        }
    }
}

#[pinned_drop]
impl<T: MultishotPayload> PinnedDrop for Multishot<T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();

        if let OpState::Submitted { idx } = this.state {
            cancel_in_flight(*idx);
        }
    }
}
