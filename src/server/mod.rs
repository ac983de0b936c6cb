use crate::runtime;
use anyhow::{anyhow, ensure, Context, Result};
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;
use tracing::info;

pub(crate) mod socket;

pub(crate) mod worker;

/// Multi-worker HTTP/1.x static file server.
///
/// Each worker is one native thread with its own `SO_REUSEPORT` listener,
/// ring, buffer pool, and scheduler; the kernel spreads connections across
/// them and nothing is shared. The first listener is bound eagerly so that
/// binding to port 0 yields a concrete port before workers spawn.
pub struct Server {
    listener: OwnedFd,
    addr: SocketAddr,
    workers: usize,
    root: PathBuf,
    runtime: runtime::Builder,
}

impl Server {
    /// Binds the first listener. Fails fast on an unusable address.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let (listener, addr) = socket::bind_listener(addr)?;

        Ok(Self {
            listener,
            addr,
            workers: thread::available_parallelism()?.get(),
            root: PathBuf::from("."),
            runtime: runtime::Builder::new(),
        })
    }

    /// Sets the number of worker threads. Defaults to one per CPU.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the directory request paths resolve under. Defaults to the
    /// current directory.
    pub fn document_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Overrides per-worker runtime geometry (ring and buffer sizing).
    pub fn runtime(mut self, builder: runtime::Builder) -> Self {
        self.runtime = builder;
        self
    }

    /// Address the server is reachable at; useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server. Spawns one event-loop thread per worker and parks
    /// here joining them; only returns if a worker dies, so a clean exit is
    /// not reachable in normal operation.
    pub fn serve(self) -> Result<()> {
        ensure!(self.workers > 0, "need at least one worker");

        info!(
            addr = %self.addr,
            workers = self.workers,
            root = %self.root.display(),
            "serving"
        );

        let mut first = Some(self.listener);
        let mut handles = Vec::with_capacity(self.workers);

        for i in 0..self.workers {
            let listener = match first.take() {
                Some(listener) => listener,
                None => socket::bind_listener(self.addr)?.0,
            };

            let root = self.root.clone();
            let runtime_builder = self.runtime;

            let handle = thread::Builder::new()
                .name(format!("riptide-worker-{}", i))
                .spawn(move || {
                    let runtime = runtime_builder
                        .try_build()
                        .expect("worker runtime initialization failed");

                    runtime.block_on(worker::accept_loop(listener, Rc::new(root)));
                })
                .context("spawning worker thread")?;

            handles.push(handle);
        }

        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            handle
                .join()
                .map_err(|_| anyhow!("{} terminated abnormally", name))?;
        }

        Ok(())
    }
}
