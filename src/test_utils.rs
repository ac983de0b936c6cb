use crate::runtime::{Builder, Runtime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Wake, Waker};

/// Installs a small runtime on the current test thread. Each `#[test]` runs
/// on its own thread, so tests never share a context.
pub(crate) fn init_test_runtime() -> Runtime {
    Builder::new()
        .sq_entries(64)
        .try_build()
        .expect("failed to initialize test runtime")
}

pub(crate) struct WakerData {
    count: AtomicUsize,
}

impl WakerData {
    pub(crate) fn wake_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Wake for WakerData {
    fn wake(self: Arc<Self>) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// A waker that only counts how often it fires.
pub(crate) fn mock_waker() -> (Waker, Arc<WakerData>) {
    let data = Arc::new(WakerData {
        count: AtomicUsize::new(0),
    });

    (Waker::from(Arc::clone(&data)), data)
}
