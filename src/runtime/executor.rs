use crate::context;
use crate::runtime::waker::{task_waker, ROOT_TASK};
use slab::Slab;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Thread-local cooperative scheduler.
///
/// Tasks are stored in a slab keyed by id; the ready queue is FIFO, so
/// resumptions happen in exactly the order completions were dispatched.
/// While a task is being polled its slot holds `None`; wakes arriving during
/// the poll still enqueue the id and are honored on the next loop pass.
pub(crate) struct Scheduler {
    tasks: Slab<Option<LocalFuture>>,
    ready: VecDeque<usize>,
    root_woken: bool,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Slab::new(),
            ready: VecDeque::new(),
            root_woken: false,
        }
    }

    pub(crate) fn schedule(&mut self, id: usize) {
        if id == ROOT_TASK {
            self.root_woken = true;
        } else if self.tasks.contains(id) {
            self.ready.push_back(id);
        }
    }

    fn insert(&mut self, future: LocalFuture) -> usize {
        self.tasks.insert(Some(future))
    }

    fn next_ready(&mut self) -> Option<usize> {
        self.ready.pop_front()
    }

    fn take_root_woken(&mut self) -> bool {
        std::mem::take(&mut self.root_woken)
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.tasks.len()
    }
}

struct JoinState<T> {
    result: Option<T>,
    waiter: Option<Waker>,
}

/// Handle to a spawned task.
///
/// Awaiting it parks the awaiter until the task's final completion, then
/// yields the task's return value through the shared result slot. Dropping
/// the handle detaches the task: it keeps running and destroys itself when
/// it finishes.
pub struct JoinHandle<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();

        match state.result.take() {
            Some(value) => Poll::Ready(value),
            None => {
                state.waiter = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Spawns a task onto this thread's scheduler.
///
/// The task starts eagerly: it runs on the spot until its first suspension
/// point, and control returns here once it parks (or finishes).
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let state = Rc::new(RefCell::new(JoinState {
        result: None,
        waiter: None,
    }));

    let shared = Rc::clone(&state);
    let wrapped = async move {
        let output = future.await;

        let waiter = {
            let mut state = shared.borrow_mut();
            state.result = Some(output);
            state.waiter.take()
        };

        if let Some(waiter) = waiter {
            waiter.wake();
        }
    };

    let id = context::with_scheduler_mut(|s| s.insert(Box::pin(wrapped)));
    run_task(id);

    JoinHandle { state }
}

/// Polls task `id` once. Removes it from the scheduler on final completion;
/// ids without a live task (already finished, or currently on the stack) are
/// ignored.
fn run_task(id: usize) {
    let Some(mut future) = context::with_scheduler_mut(|s| s.tasks.get_mut(id).and_then(Option::take))
    else {
        return;
    };

    let waker = task_waker(id);
    let mut cx = Context::from_waker(&waker);

    match future.as_mut().poll(&mut cx) {
        Poll::Ready(()) => {
            context::with_scheduler_mut(|s| {
                s.tasks.try_remove(id);
            });
        }
        Poll::Pending => context::with_scheduler_mut(|s| {
            if let Some(slot) = s.tasks.get_mut(id) {
                *slot = Some(future);
            }
        }),
    }
}

/// Drives the event loop on the calling thread until `root` completes, then
/// returns its output.
///
/// One pass: drain the ready queue in FIFO order, poll the root if it was
/// woken, and otherwise block in `submit_and_wait(1)` until the kernel posts
/// a completion. Completion dispatch copies result and flags into the op
/// descriptor and wakes its continuation; the continuation runs on this same
/// thread on the next queue drain, before any later completion's.
pub fn block_on<F: Future>(root: F) -> F::Output {
    let mut root = std::pin::pin!(root);
    let waker = task_waker(ROOT_TASK);
    let mut cx = Context::from_waker(&waker);

    context::with_scheduler_mut(|s| s.root_woken = true);

    loop {
        while let Some(id) = context::with_scheduler_mut(Scheduler::next_ready) {
            run_task(id);
        }

        if context::with_scheduler_mut(Scheduler::take_root_woken) {
            if let Poll::Ready(output) = root.as_mut().poll(&mut cx) {
                return output;
            }
            // Polling the root may have spawned or woken tasks.
            continue;
        }

        // Idle: every live task is parked on a kernel op. If nothing is in
        // flight either, no completion can ever wake us again.
        let in_flight = context::with_ops_mut(|ops| ops.in_flight());
        assert!(
            in_flight > 0,
            "deadlock: root future is pending but no tasks are ready and no ops are in flight"
        );

        context::with_ops_and_ring_mut(|ops, ring| {
            loop {
                match ring.submit_and_wait(1) {
                    Ok(_) => break,
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                    // No recovery path for a failed event loop.
                    Err(e) => panic!("io_uring submit_and_wait failed: {}", e),
                }
            }

            ring.process_completions(ops);
        });
    }
}

/// Runs each root to completion in order and collects the results. Roots are
/// driven sequentially; concurrency comes from whatever each root spawns.
pub fn block_on_all<I>(roots: I) -> Vec<<I::Item as Future>::Output>
where
    I: IntoIterator,
    I::Item: Future,
{
    roots.into_iter().map(block_on).collect()
}

/// Yields to the scheduler once: parks the task at the back of the ready
/// queue and resumes it after everything already queued has run.
pub fn yield_now() -> impl Future<Output = ()> {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    YieldNow { yielded: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_runtime;
    use std::cell::Cell;

    #[test]
    fn test_block_on_returns_root_output() {
        let _rt = init_test_runtime();
        assert_eq!(block_on(async { 42 }), 42);
    }

    #[test]
    fn test_spawn_starts_eagerly() {
        let _rt = init_test_runtime();

        let flag = Rc::new(Cell::new(false));
        let task_flag = Rc::clone(&flag);

        let handle = spawn(async move {
            task_flag.set(true);
            7
        });

        // No suspension points: the task ran to completion inside `spawn`.
        assert!(flag.get());
        assert_eq!(block_on(handle), 7);
    }

    #[test]
    fn test_join_across_suspension() {
        let _rt = init_test_runtime();

        let handle = spawn(async {
            yield_now().await;
            yield_now().await;
            "done"
        });

        assert_eq!(block_on(handle), "done");
    }

    #[test]
    fn test_detached_task_destroys_itself() {
        let _rt = init_test_runtime();

        let flag = Rc::new(Cell::new(false));
        let task_flag = Rc::clone(&flag);

        drop(spawn(async move {
            yield_now().await;
            task_flag.set(true);
        }));

        assert!(!flag.get(), "task is parked at its yield point");

        block_on(async {
            yield_now().await;
            yield_now().await;
        });

        assert!(flag.get());
        assert_eq!(context::with_scheduler_mut(|s| s.live_tasks()), 0);
    }

    #[test]
    fn test_block_on_all_collects_in_input_order() {
        let _rt = init_test_runtime();

        let roots = (0..4).map(|i| async move {
            yield_now().await;
            i * 10
        });

        assert_eq!(block_on_all(roots), vec![0, 10, 20, 30]);
    }

    #[test]
    #[should_panic(expected = "deadlock")]
    fn test_block_on_detects_deadlock() {
        let _rt = init_test_runtime();
        block_on(std::future::pending::<()>());
    }
}
