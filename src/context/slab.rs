use crate::ops::IoError;
use slab::Slab;
use std::collections::VecDeque;
use std::task::Waker;

/// Result and flags copied out of a completion-queue entry. The flags carry
/// the kernel-selected buffer id for buffer-select recv and the MORE bit for
/// multishot ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpResult {
    pub(crate) res: i32,
    pub(crate) flags: u32,
}

/// Per-op completion storage.
///
/// `Reap` descriptors back the async-cancel submitted when an in-flight op is
/// dropped: the reaper outlives the dropped future and owns removal of the
/// cancelled descriptor once the kernel confirms the cancel.
#[derive(Debug)]
pub(crate) enum Completion {
    Single { result: Option<OpResult> },
    Stream { results: VecDeque<OpResult>, done: bool },
    Reap { target: usize },
}

impl Completion {
    pub(crate) fn single() -> Self {
        Completion::Single { result: None }
    }

    pub(crate) fn stream() -> Self {
        Completion::Stream {
            results: VecDeque::new(),
            done: false,
        }
    }

    pub(crate) fn reap(target: usize) -> Self {
        Completion::Reap { target }
    }
}

/// One in-flight kernel op. The slab index doubles as the op's user-data, so
/// the descriptor stays at a stable, unique address (slot) for as long as the
/// kernel can still post a completion for it.
#[derive(Debug)]
pub(crate) struct OpDescriptor {
    waker: Option<Waker>,
    cancelled: bool,
    completion: Completion,
}

impl OpDescriptor {
    fn new(completion: Completion) -> Self {
        Self {
            waker: None,
            cancelled: false,
            completion,
        }
    }

    /// Whether the kernel may still post at least one completion for this op.
    /// Entries are only removed from the slab once this turns false (or a
    /// reaper takes over ownership).
    fn expects_more(&self) -> bool {
        match &self.completion {
            Completion::Single { result } => result.is_none(),
            Completion::Stream { done, .. } => !done,
            Completion::Reap { .. } => true,
        }
    }
}

/// Outcome of polling a stream descriptor for its next buffered result.
#[derive(Debug)]
pub(crate) enum StreamPoll {
    Item(OpResult),
    Pending,
    Done,
}

/// What the dropper of an in-flight op must do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CancelDisposition {
    /// The descriptor had no pending completions and was removed in place.
    Removed,
    /// The descriptor is still live in the kernel: submit an async cancel
    /// with a reaper descriptor.
    NeedsCancel,
}

#[derive(Debug)]
pub(crate) struct OpSlab {
    entries: Slab<OpDescriptor>,
    capacity: usize,

    /// Number of slab entries still expecting at least one completion. The
    /// event loop uses this to distinguish "blocked on the kernel" from a
    /// genuine deadlock.
    in_flight: usize,
}

impl OpSlab {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Slab::with_capacity(capacity),
            capacity,
            in_flight: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Reserve a descriptor slot. The returned key is the op's user-data.
    /// The caller must either push a matching submission entry or call
    /// [`OpSlab::abort`] to back out.
    pub(crate) fn insert(&mut self, completion: Completion) -> Result<usize, IoError> {
        if self.entries.len() >= self.capacity {
            return Err(IoError::SlabFull);
        }

        Ok(self.entries.insert(OpDescriptor::new(completion)))
    }

    /// Back out of a reservation whose submission entry was never pushed.
    pub(crate) fn abort(&mut self, idx: usize) {
        self.entries.try_remove(idx);
    }

    /// Account for a successfully pushed submission entry.
    pub(crate) fn note_submitted(&mut self) {
        self.in_flight += 1;
    }

    pub(crate) fn set_waker(&mut self, idx: usize, waker: &Waker) {
        if let Some(desc) = self.entries.get_mut(idx) {
            match desc.waker.as_ref() {
                Some(current) if current.will_wake(waker) => {}
                _ => desc.waker = Some(waker.clone()),
            }
        }
    }

    /// Take the result of a completed single op, freeing its slot.
    pub(crate) fn take_result(&mut self, idx: usize) -> Option<OpResult> {
        let ready = matches!(
            self.entries.get(idx),
            Some(OpDescriptor {
                completion: Completion::Single { result: Some(_) },
                ..
            })
        );

        if !ready {
            return None;
        }

        match self.entries.remove(idx).completion {
            Completion::Single { result } => result,
            _ => unreachable!("checked single completion above"),
        }
    }

    /// Pop the next buffered result of a stream op. Frees the slot once the
    /// stream is done and drained.
    pub(crate) fn pop_stream(&mut self, idx: usize) -> StreamPoll {
        let Some(desc) = self.entries.get_mut(idx) else {
            return StreamPoll::Done;
        };

        match &mut desc.completion {
            Completion::Stream { results, done } => match results.pop_front() {
                Some(result) => StreamPoll::Item(result),
                None if *done => {
                    self.entries.remove(idx);
                    StreamPoll::Done
                }
                None => StreamPoll::Pending,
            },
            other => panic!("pop_stream on non-stream descriptor: {:?}", other),
        }
    }

    /// Detach a descriptor from its dropped future. Clears the continuation
    /// slot so the dispatch loop discards any completion that still arrives.
    pub(crate) fn mark_cancelled(&mut self, idx: usize) -> CancelDisposition {
        let Some(desc) = self.entries.get_mut(idx) else {
            return CancelDisposition::Removed;
        };

        if !desc.expects_more() {
            self.entries.remove(idx);
            return CancelDisposition::Removed;
        }

        desc.waker = None;
        desc.cancelled = true;
        CancelDisposition::NeedsCancel
    }

    /// Record a completion into descriptor `idx` and resume its continuation.
    /// Unknown indices are ignored: they belong to ops whose cancel already
    /// reaped them.
    pub(crate) fn on_completion(&mut self, idx: usize, result: OpResult) {
        enum Action {
            None,
            Wake(Waker),
        }

        let action = {
            let Some(desc) = self.entries.get_mut(idx) else {
                tracing::debug!(idx, "completion for unknown descriptor, discarding");
                return;
            };

            match &mut desc.completion {
                Completion::Single { result: slot } => {
                    *slot = Some(result);
                    self.in_flight -= 1;
                }
                Completion::Stream { results, done } => {
                    if !io_uring::cqueue::more(result.flags) {
                        *done = true;
                        self.in_flight -= 1;
                    }
                    if !desc.cancelled {
                        results.push_back(result);
                    }
                }
                Completion::Reap { target } => {
                    let target = *target;
                    self.in_flight -= 1;
                    self.entries.remove(idx);
                    return self.reap(target);
                }
            }

            if desc.cancelled {
                Action::None
            } else {
                match desc.waker.take() {
                    Some(waker) => Action::Wake(waker),
                    None => Action::None,
                }
            }
        };

        // A cancelled descriptor is held only for the completions the kernel
        // still owes it; free the slot once the last one has landed.
        if let Some(desc) = self.entries.get(idx) {
            if desc.cancelled && !desc.expects_more() {
                self.entries.remove(idx);
            }
        }

        match action {
            Action::Wake(waker) => waker.wake(),
            Action::None => {}
        }
    }

    /// The async cancel for `target` has completed. The target slot can only
    /// be freed if it is still the cancelled descriptor (cancelled targets
    /// usually free themselves on their final completion, after which the
    /// index may already back a new, unrelated op) and the kernel owes it no
    /// further completion.
    fn reap(&mut self, target: usize) {
        if let Some(desc) = self.entries.get(target) {
            if desc.cancelled && !desc.expects_more() {
                self.entries.remove(target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_waker;

    // From the uapi; only needed to fabricate CQE flags in tests. Production
    // code goes through `io_uring::cqueue::{more, buffer_select}`.
    const CQE_F_BUFFER: u32 = 1;
    const CQE_F_MORE: u32 = 1 << 1;
    const CQE_BUFFER_SHIFT: u32 = 16;

    fn buffer_flags(bid: u16) -> u32 {
        ((bid as u32) << CQE_BUFFER_SHIFT) | CQE_F_BUFFER
    }

    #[test]
    fn test_single_op_lifecycle() {
        let mut slab = OpSlab::new(8);
        let (waker, data) = mock_waker();

        let idx = slab.insert(Completion::single()).unwrap();
        slab.note_submitted();
        slab.set_waker(idx, &waker);

        assert_eq!(slab.in_flight(), 1);
        assert!(slab.take_result(idx).is_none());

        slab.on_completion(idx, OpResult { res: 42, flags: 0 });
        assert_eq!(data.wake_count(), 1);
        assert_eq!(slab.in_flight(), 0);

        let result = slab.take_result(idx).unwrap();
        assert_eq!(result.res, 42);
        assert_eq!(slab.len(), 0, "slot freed once the result is consumed");
    }

    #[test]
    fn test_stream_buffers_results_until_final_completion() {
        let mut slab = OpSlab::new(8);
        let (waker, data) = mock_waker();

        let idx = slab.insert(Completion::stream()).unwrap();
        slab.note_submitted();

        for fd in [7, 8] {
            slab.set_waker(idx, &waker);
            slab.on_completion(
                idx,
                OpResult {
                    res: fd,
                    flags: CQE_F_MORE,
                },
            );
        }
        assert_eq!(data.wake_count(), 2);
        assert_eq!(slab.in_flight(), 1, "MORE flag keeps the op in flight");

        assert!(matches!(
            slab.pop_stream(idx),
            StreamPoll::Item(OpResult { res: 7, .. })
        ));
        assert!(matches!(
            slab.pop_stream(idx),
            StreamPoll::Item(OpResult { res: 8, .. })
        ));
        assert!(matches!(slab.pop_stream(idx), StreamPoll::Pending));

        // Final completion without MORE retires the stream.
        slab.on_completion(idx, OpResult { res: 9, flags: 0 });
        assert_eq!(slab.in_flight(), 0);

        assert!(matches!(
            slab.pop_stream(idx),
            StreamPoll::Item(OpResult { res: 9, .. })
        ));
        assert!(matches!(slab.pop_stream(idx), StreamPoll::Done));
        assert_eq!(slab.len(), 0);
    }

    #[test]
    fn test_cancelled_op_discards_completion_without_waking() {
        let mut slab = OpSlab::new(8);
        let (waker, data) = mock_waker();

        let idx = slab.insert(Completion::single()).unwrap();
        slab.note_submitted();
        slab.set_waker(idx, &waker);

        assert_eq!(slab.mark_cancelled(idx), CancelDisposition::NeedsCancel);

        // The op completed normally before the cancel took effect: the result
        // is discarded, nobody is resumed, and the slot frees itself.
        slab.on_completion(idx, OpResult { res: 42, flags: 0 });
        assert_eq!(data.wake_count(), 0);
        assert_eq!(slab.in_flight(), 0);
        assert_eq!(slab.len(), 0);
    }

    #[test]
    fn test_cancel_after_completion_removes_in_place() {
        let mut slab = OpSlab::new(8);

        let idx = slab.insert(Completion::single()).unwrap();
        slab.note_submitted();
        slab.on_completion(idx, OpResult { res: 0, flags: 0 });

        // Result arrived but was never read: nothing left in flight, so the
        // dropper can free the slot without a kernel round-trip.
        assert_eq!(slab.mark_cancelled(idx), CancelDisposition::Removed);
        assert_eq!(slab.len(), 0);
    }

    #[test]
    fn test_reaper_frees_cancelled_descriptor() {
        let mut slab = OpSlab::new(8);

        let target = slab.insert(Completion::stream()).unwrap();
        slab.note_submitted();
        assert_eq!(slab.mark_cancelled(target), CancelDisposition::NeedsCancel);

        let reaper = slab.insert(Completion::reap(target)).unwrap();
        slab.note_submitted();
        assert_eq!(slab.len(), 2);

        // Kernel posts the target's terminal ECANCELED completion first, then
        // the cancel's own completion.
        slab.on_completion(
            target,
            OpResult {
                res: -libc::ECANCELED,
                flags: 0,
            },
        );
        slab.on_completion(reaper, OpResult { res: 0, flags: 0 });

        assert_eq!(slab.len(), 0);
        assert_eq!(slab.in_flight(), 0);
    }

    #[test]
    fn test_reaper_leaves_still_pending_target_alone() {
        let mut slab = OpSlab::new(8);

        let target = slab.insert(Completion::single()).unwrap();
        slab.note_submitted();
        assert_eq!(slab.mark_cancelled(target), CancelDisposition::NeedsCancel);

        let reaper = slab.insert(Completion::reap(target)).unwrap();
        slab.note_submitted();

        // Cancel completes with EALREADY: the target op is mid-flight and
        // will still post a normal completion later. Its slot must survive so
        // the late completion cannot be misdelivered to a recycled index.
        slab.on_completion(
            reaper,
            OpResult {
                res: -libc::EALREADY,
                flags: 0,
            },
        );
        assert_eq!(slab.len(), 1);

        slab.on_completion(target, OpResult { res: 13, flags: 0 });
        assert_eq!(slab.len(), 0);
        assert_eq!(slab.in_flight(), 0);
    }

    #[test]
    fn test_slab_full() {
        let mut slab = OpSlab::new(1);
        assert_eq!(slab.capacity(), 1);

        let _idx = slab.insert(Completion::single()).unwrap();

        assert!(matches!(
            slab.insert(Completion::single()),
            Err(IoError::SlabFull)
        ));
    }

    #[test]
    fn test_buffer_flags_round_trip() {
        // The helper mirrors what the kernel does for buffer-select recv;
        // make sure the production-side parser agrees with it.
        let flags = buffer_flags(123);
        assert_eq!(io_uring::cqueue::buffer_select(flags), Some(123));
        assert!(!io_uring::cqueue::more(flags));
        assert!(io_uring::cqueue::more(CQE_F_MORE));
    }
}
