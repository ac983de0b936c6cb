use anyhow::{Context, Result};
use nix::sys::socket::sockopt::{ReuseAddr, ReusePort};
use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage,
};
use std::fs::File;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Component, Path};

const LISTEN_BACKLOG: i32 = 1024;

/// Creates a TCP listening socket on `addr`.
///
/// Every worker binds its own socket to the same address; `SO_REUSEPORT`
/// makes the kernel load-balance incoming connections across them. Returns
/// the bound address so an ephemeral port request (`:0`) resolves to the
/// concrete port the remaining workers must reuse.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<(OwnedFd, SocketAddr)> {
    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };

    let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .context("creating listener socket")?;

    socket::setsockopt(&fd, ReuseAddr, &true).context("setting SO_REUSEADDR")?;
    socket::setsockopt(&fd, ReusePort, &true).context("setting SO_REUSEPORT")?;

    socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))
        .with_context(|| format!("binding to {}", addr))?;
    socket::listen(&fd, Backlog::new(LISTEN_BACKLOG)?).context("listening")?;

    let bound = socket::getsockname::<SockaddrStorage>(fd.as_raw_fd())
        .context("reading bound address")?;
    let bound = to_socket_addr(&bound).context("unexpected listener address family")?;

    Ok((fd, bound))
}

fn to_socket_addr(addr: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        return Some(SocketAddr::V4(SocketAddrV4::new(sin.ip(), sin.port())));
    }

    if let Some(sin6) = addr.as_sockaddr_in6() {
        return Some(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }

    None
}

/// Resolves a request URL to a regular file under the document root.
///
/// The URL is taken relative to `root`; absolute paths and any `..`
/// component are refused so a request can never escape the root. `None`
/// means 404, whatever the reason.
pub(crate) fn resolve_file(root: &Path, url: &str) -> Option<(File, u64)> {
    let rel = Path::new(url.strip_prefix('/').unwrap_or(url));

    if rel.as_os_str().is_empty() || rel.is_absolute() {
        return None;
    }
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }

    let file = File::open(root.join(rel)).ok()?;
    let metadata = file.metadata().ok()?;

    if !metadata.is_file() {
        return None;
    }

    Some((file, metadata.len()))
}
