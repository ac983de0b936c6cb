use std::task::{RawWaker, RawWakerVTable, Waker};

/// Sentinel task id for the root future driven by `block_on`.
pub(crate) const ROOT_TASK: usize = usize::MAX;

/// Builds a waker whose payload is a task id in this thread's scheduler.
///
/// Cloning copies the id, waking pushes it onto the thread-local ready queue
/// (or sets the root-woken flag). There is no reference counting: the
/// scheduler ignores ids whose task is gone, and a stale wake is at worst a
/// spurious poll.
///
/// These wakers are only ever created, stored, and invoked on the worker
/// thread that owns the scheduler; no continuation is resumed on any other
/// thread. Sending one across threads would panic on first use because the
/// target thread has no (or a different) worker context.
pub(crate) fn task_waker(id: usize) -> Waker {
    unsafe { Waker::from_raw(raw_waker(id as *const ())) }
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_raw);

fn raw_waker(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

unsafe fn clone(data: *const ()) -> RawWaker {
    raw_waker(data)
}

unsafe fn wake(data: *const ()) {
    schedule(data as usize);
}

unsafe fn wake_by_ref(data: *const ()) {
    schedule(data as usize);
}

unsafe fn drop_raw(_data: *const ()) {}

fn schedule(id: usize) {
    crate::context::with_scheduler_mut(|scheduler| scheduler.schedule(id));
}
