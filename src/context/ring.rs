use crate::context::slab::{OpResult, OpSlab};
use crate::ops::IoError;
use anyhow::Result;
use io_uring::squeue::Entry;
use io_uring::IoUring;
use std::io;

/// Thin façade over the kernel submission/completion ring.
///
/// The gateway never interprets user-data: every pushed entry carries an
/// [`OpSlab`] index and completions are routed back through it verbatim.
/// Completion order is whatever the kernel produced; callers must not assume
/// anything beyond "one completion per op, except multishot".
pub(crate) struct Ring {
    ring: IoUring,
}

impl Ring {
    pub(crate) fn try_new(sq_entries: u32) -> Result<Self> {
        let ring = IoUring::builder()
            // Keep submitting queued SQEs even if one of them errors; errors
            // come back as CQEs and are handled where the op is awaited.
            .setup_submit_all()
            // Each ring is owned by exactly one worker thread.
            .setup_single_issuer()
            .build(sq_entries)?;

        if !ring.params().is_feature_nodrop() {
            tracing::warn!(
                "IORING_FEAT_NODROP is not available; the kernel may drop completions if the CQ ring overflows"
            );
        }

        Ok(Ring { ring })
    }

    pub(crate) fn sq_capacity(&mut self) -> usize {
        self.ring.submission().capacity()
    }

    pub(crate) fn sq_len(&mut self) -> usize {
        self.ring.submission().len()
    }

    /// Queue one submission entry. A full SQ ring surfaces as
    /// [`IoError::SqRingFull`], which is fatal to the worker: the ring is a
    /// deployment parameter sized so this cannot happen under design load.
    pub(crate) fn push(&mut self, entry: &Entry) -> Result<(), IoError> {
        unsafe { self.ring.submission().push(entry).map_err(IoError::from) }
    }

    /// Flush the submission queue and block until at least `want`
    /// completions are available.
    pub(crate) fn submit_and_wait(&mut self, want: usize) -> io::Result<usize> {
        self.ring.submission().sync();
        self.ring.submitter().submit_and_wait(want)
    }

    /// Flush the submission queue without waiting.
    pub(crate) fn submit(&mut self) -> io::Result<usize> {
        self.ring.submission().sync();
        self.ring.submitter().submit()
    }

    /// Drain every ready completion: copy result and flags into the matching
    /// descriptor, acknowledge the CQE, and resume the stored continuation.
    /// Resumptions happen synchronously on this thread, in completion-queue
    /// order.
    pub(crate) fn process_completions(&mut self, ops: &mut OpSlab) -> usize {
        let mut completed = 0;

        loop {
            let mut cq = self.ring.completion();
            cq.sync();

            if cq.len() == 0 {
                return completed;
            }

            for cqe in &mut cq {
                completed += 1;
                ops.on_completion(
                    cqe.user_data() as usize,
                    OpResult {
                        res: cqe.result(),
                        flags: cqe.flags(),
                    },
                );
            }
            // Dropping the queue syncs the head: every entry above is now
            // acknowledged to the kernel.
        }
    }

    pub(crate) fn submitter(&self) -> io_uring::Submitter<'_> {
        self.ring.submitter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;
    use crate::context::slab::Completion;
    use crate::test_utils::*;

    fn nop(user_data: u64) -> Entry {
        io_uring::opcode::Nop::new().build().user_data(user_data)
    }

    #[test]
    fn test_nop_submit_and_complete() {
        let _rt = init_test_runtime();
        let (waker, data) = mock_waker();

        context::with_ops_and_ring_mut(|ops, ring| {
            let idx = ops.insert(Completion::single()).unwrap();
            ring.push(&nop(idx as u64)).unwrap();
            ops.note_submitted();
            ops.set_waker(idx, &waker);

            assert_eq!(ring.sq_len(), 1);
            assert_eq!(ring.submit_and_wait(1).unwrap(), 1);
            assert_eq!(ring.sq_len(), 0);

            assert_eq!(ring.process_completions(ops), 1);
            assert_eq!(data.wake_count(), 1);

            let result = ops.take_result(idx).unwrap();
            assert_eq!(result.res, 0);
            assert_eq!(ops.in_flight(), 0);
        });
    }

    #[test]
    fn test_completion_for_reaped_descriptor_is_discarded() {
        let _rt = init_test_runtime();

        context::with_ops_and_ring_mut(|ops, ring| {
            let idx = ops.insert(Completion::single()).unwrap();
            ring.push(&nop(idx as u64)).unwrap();
            ops.note_submitted();

            // Simulate the reaper having already freed the slot.
            ops.abort(idx);

            ring.submit_and_wait(1).unwrap();
            // Must not panic or resume anyone.
            assert_eq!(ring.process_completions(ops), 1);
        });
    }

    #[test]
    fn test_sq_ring_full_is_reported() {
        let _rt = init_test_runtime();

        context::with_ops_and_ring_mut(|_ops, ring| {
            let capacity = ring.sq_capacity();

            for i in 0..capacity {
                ring.push(&nop(i as u64)).unwrap();
            }

            assert!(matches!(
                ring.push(&nop(u64::MAX)),
                Err(IoError::SqRingFull)
            ));

            // Drain so the context tears down with an empty ring.
            ring.submit_and_wait(capacity).unwrap();
        });
    }
}
