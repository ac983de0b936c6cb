use crate::context;
use crate::http::{HttpRequest, HttpResponse, ParseOutcome, RequestParser};
use crate::ops::{
    AcceptMultishot, IoError, Multishot, Op, RecvOp, RecvOutcome, SendOp, SpliceOp,
};
use crate::runtime::{spawn, yield_now};
use futures::StreamExt;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// File bytes move through the splice pipe in chunks of this size.
const SPLICE_CHUNK: u32 = 64 * 1024;

/// Per-worker accept loop: one multishot accept feeds detached handler
/// tasks, one per connection. Accept errors are non-fatal: log, skip,
/// continue. If the kernel retires the multishot submission, install a
/// fresh one.
pub(crate) async fn accept_loop(listener: OwnedFd, root: Rc<PathBuf>) {
    loop {
        let mut incoming = Multishot::new(AcceptMultishot::new(listener.as_raw_fd()));

        while let Some(next) = incoming.next().await {
            match next {
                Ok(conn) => {
                    let root = Rc::clone(&root);
                    drop(spawn(async move {
                        let fd = conn.as_raw_fd();
                        debug!(fd, "connection accepted");

                        if let Err(e) = handle_client(conn, &root).await {
                            debug!(fd, error = %e, "connection closed on error");
                        }
                    }));
                }
                Err(e) => warn!(error = %e, "accept failed, skipping"),
            }
        }

        warn!("multishot accept retired by the kernel, re-arming");
    }
}

/// Drives one connection: recv, parse, respond, until the peer closes or an
/// op fails. At most one recv is in flight at a time, and the selected
/// buffer is returned to the ring before the next suspension point on every
/// path.
async fn handle_client(conn: OwnedFd, root: &Path) -> Result<(), IoError> {
    let fd = conn.as_raw_fd();
    let recv_len = context::buffer_size() as u32;
    let mut parser = RequestParser::new();

    loop {
        let outcome = match Op::new(RecvOp::new(fd, recv_len)).await {
            Ok(outcome) => outcome,
            // Every pool buffer is borrowed by some other connection. Flush
            // the ring so their in-flight sends can finish, yield so their
            // handlers run and return buffers, then retry.
            Err(IoError::Io(e)) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                reap_completions();
                yield_now().await;
                continue;
            }
            Err(e) => return Err(e),
        };

        let RecvOutcome::Data { bid, len } = outcome else {
            debug!(fd, "peer closed");
            return Ok(());
        };

        {
            let buf = context::borrow_buffer(bid, len);
            if buf.is_empty() {
                return Ok(());
            }
            parser.push(&buf);
        }

        // The recv may have carried several pipelined requests; answer all
        // of them before reading again.
        loop {
            match parser.next_request() {
                ParseOutcome::Complete(request) => respond(fd, root, &request).await?,
                ParseOutcome::Incomplete => break,
                ParseOutcome::Invalid => {
                    debug!(fd, "unparseable request, closing");
                    return Ok(());
                }
            }
        }
    }
}

/// Submit pending SQEs and dispatch whatever has already completed, without
/// blocking. Only needed on the buffer-exhaustion path, where waiting for
/// the event loop's next idle pass would spin without ever flushing the
/// submissions that free buffers.
fn reap_completions() {
    context::with_ops_and_ring_mut(|ops, ring| {
        if let Err(e) = ring.submit() {
            warn!(error = %e, "flushing submission queue failed");
        }
        ring.process_completions(ops);
    });
}

async fn respond(fd: RawFd, root: &Path, request: &HttpRequest) -> Result<(), IoError> {
    match crate::server::socket::resolve_file(root, &request.url) {
        Some((file, size)) => {
            debug!(url = %request.url, size, status = 200, "serving file");

            let mut response = HttpResponse::ok(&request.version);
            response.header("content-length", size.to_string());

            send_all(fd, response.serialize()).await?;
            splice_file(&file, fd, size).await
        }
        None => {
            debug!(url = %request.url, status = 404, "no such file");
            send_all(fd, HttpResponse::not_found(&request.version).serialize()).await
        }
    }
}

/// Sends the whole buffer, resuming after short sends.
async fn send_all(fd: RawFd, mut buf: Vec<u8>) -> Result<(), IoError> {
    let mut offset = 0;

    while offset < buf.len() {
        let (sent, returned) = Op::new(SendOp::with_offset(fd, buf, offset)).await?;
        if sent == 0 {
            return Err(IoError::Io(io::ErrorKind::WriteZero.into()));
        }

        offset += sent;
        buf = returned;
    }

    Ok(())
}

/// Moves `size` bytes of `file` to the socket without copying through user
/// space. Linux only splices when one side is a pipe, so the transfer hops
/// through an internal one: file -> pipe, pipe -> socket, in chunks. The
/// file descriptor is released when this returns.
async fn splice_file(file: &File, socket: RawFd, size: u64) -> Result<(), IoError> {
    let (pipe_r, pipe_w) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;

    let mut remaining = size;
    while remaining > 0 {
        let chunk = remaining.min(u64::from(SPLICE_CHUNK)) as u32;

        let filled = Op::new(SpliceOp::new(file.as_raw_fd(), pipe_w.as_raw_fd(), chunk)).await?;
        if filled == 0 {
            // File shrank under us; the peer sees a short body.
            warn!(remaining, "file truncated mid-splice");
            return Ok(());
        }

        let mut in_pipe = filled;
        while in_pipe > 0 {
            let drained =
                Op::new(SpliceOp::new(pipe_r.as_raw_fd(), socket, in_pipe as u32)).await?;
            if drained == 0 {
                return Err(IoError::Io(io::ErrorKind::WriteZero.into()));
            }
            in_pipe -= drained;
        }

        remaining -= filled as u64;
    }

    Ok(())
}
