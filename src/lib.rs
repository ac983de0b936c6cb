//! riptide — a multi-threaded HTTP/1.x static file server built on a
//! completion-based io_uring runtime.
//!
//! Every worker thread owns a full stack in isolation: an io_uring instance,
//! a kernel-shared pool of receive buffers, an op-descriptor table, and a
//! cooperative single-threaded scheduler. Awaitable ops translate kernel
//! submissions into suspension points; the per-worker event loop dispatches
//! completions back into the suspended tasks in completion-queue order.

pub(crate) mod context;

pub mod http;

pub(crate) mod ops;

pub mod runtime;
pub use runtime::{block_on, block_on_all, spawn, yield_now, Builder, JoinHandle, Runtime};

pub mod server;
pub use server::Server;

#[cfg(test)]
pub(crate) mod test_utils;
