use crate::context;
use anyhow::{ensure, Result};
use std::marker::PhantomData;

pub(crate) mod executor;
pub use executor::{block_on, block_on_all, spawn, yield_now, JoinHandle};

pub(crate) mod waker;

/// Default size of the io_uring submission ring. The completion ring is twice
/// this. Sized so submission-slot exhaustion is statistically impossible
/// under design load; hitting it anyway is fatal to the worker.
const SQ_RING_SIZE: u32 = 2048;

/// Default buffer-ring geometry: 1024 buffers of 1024 bytes each.
const BUFFER_RING_SIZE: u16 = 1024;
const BUFFER_SIZE: usize = 1024;

/// Validated runtime configuration handed to the worker context.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Config {
    pub(crate) sq_entries: u32,
    pub(crate) buffer_entries: u16,
    pub(crate) buffer_size: usize,
}

/// Configures and initializes a per-thread runtime.
///
/// Ring and buffer geometry are deployment parameters; the defaults match
/// the server's design load. Building installs the worker context (ring, op
/// slab, buffer ring, scheduler) on the calling thread.
#[derive(Debug, Clone, Copy)]
pub struct Builder {
    sq_entries: u32,
    buffer_entries: u16,
    buffer_size: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            sq_entries: SQ_RING_SIZE,
            buffer_entries: BUFFER_RING_SIZE,
            buffer_size: BUFFER_SIZE,
        }
    }

    /// Sets the submission ring size.
    pub fn sq_entries(mut self, val: u32) -> Self {
        self.sq_entries = val;
        self
    }

    /// Sets the number of receive buffers. Must be a power of two.
    pub fn buffer_entries(mut self, val: u16) -> Self {
        self.buffer_entries = val;
        self
    }

    /// Sets the size of each receive buffer in bytes.
    pub fn buffer_size(mut self, val: usize) -> Self {
        self.buffer_size = val;
        self
    }

    /// Creates the configured [`Runtime`], installing this thread's worker
    /// context. Fails if a runtime is already active on this thread or if
    /// ring setup / buffer registration is refused by the kernel.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg = self.validate()?;
        context::init(&cfg)?;

        Ok(Runtime {
            _not_send: PhantomData,
        })
    }

    fn validate(self) -> Result<Config> {
        ensure!(self.sq_entries > 0, "sq_entries must be greater than 0");

        Ok(Config {
            sq_entries: self.sq_entries,
            buffer_entries: self.buffer_entries,
            buffer_size: self.buffer_size,
        })
    }
}

/// A per-thread runtime handle.
///
/// Rings, buffers, descriptors, and tasks are all thread-local; the handle
/// itself is `!Send` so it cannot leave the worker that built it.
#[derive(Debug)]
pub struct Runtime {
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    /// Drives the event loop until `root` completes. See [`block_on`].
    pub fn block_on<F: std::future::Future>(&self, root: F) -> F::Output {
        block_on(root)
    }

    /// Spawns a task onto this thread's scheduler. See [`spawn`].
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + 'static,
        F::Output: 'static,
    {
        spawn(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_not_impl_any;

    assert_not_impl_any!(Runtime: Send, Sync);

    #[test]
    fn test_builder_rejects_zero_sq_entries() {
        assert!(Builder::new().sq_entries(0).try_build().is_err());
    }

    #[test]
    fn test_builder_rejects_bad_buffer_geometry() {
        assert!(Builder::new().buffer_entries(100).try_build().is_err());
        assert!(Builder::new().buffer_size(0).try_build().is_err());
    }
}
