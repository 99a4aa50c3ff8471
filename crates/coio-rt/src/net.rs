// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Raw socket plumbing for the TCP primitives.
//!
//! Everything here is non-suspending: each call maps to one syscall and
//! returns the OS result as is. Name resolution is synchronous and IPv4
//! only.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use crate::error::CoError;

/// Resolve `host` to its first IPv4 address.
pub(crate) fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4, CoError> {
    let addrs = (host, port).to_socket_addrs().map_err(|source| CoError::Resolve {
        host: host.to_string(),
        source,
    })?;

    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| CoError::NoIpv4Address {
            host: host.to_string(),
        })
}

/// New non-blocking, close-on-exec IPv4 stream socket.
pub(crate) fn tcp_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn to_sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sin
}

fn cvt(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// One `connect` attempt. `EINPROGRESS` and friends come back as errors;
/// the caller decides whether to wait and retry.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddrV4) -> io::Result<()> {
    let sin = to_sockaddr_in(addr);
    cvt(unsafe {
        libc::connect(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })
}

/// Errors after which a connect attempt is retried once writable.
pub(crate) fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EALREADY)
    )
}

/// A repeated connect on an already connected socket reports EISCONN.
pub(crate) fn already_connected(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EISCONN)
}

/// Reuse the address, bind, and listen.
pub(crate) fn bind_listen(fd: RawFd, addr: &SocketAddrV4, backlog: i32) -> io::Result<()> {
    let one: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;

    let sin = to_sockaddr_in(addr);
    cvt(unsafe {
        libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;

    cvt(unsafe { libc::listen(fd, backlog) })
}

/// Accept one pending connection as a non-blocking socket.
pub(crate) fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut addrlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let client = unsafe {
        libc::accept4(
            fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut addrlen,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if client < 0 {
        return Err(io::Error::last_os_error());
    }

    let owned = unsafe { OwnedFd::from_raw_fd(client) };
    Ok((owned, sockaddr_to_std(&addr)))
}

/// Address a socket is bound to.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut addrlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut addrlen) })?;
    Ok(sockaddr_to_std(&addr))
}

fn sockaddr_to_std(addr: &libc::sockaddr_storage) -> SocketAddr {
    match addr.ss_family as i32 {
        libc::AF_INET => {
            let addr4 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr4.sin_addr.s_addr));
            SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr4.sin_port)))
        }
        libc::AF_INET6 => {
            let addr6 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            SocketAddr::V6(SocketAddrV6::new(
                addr6.sin6_addr.s6_addr.into(),
                u16::from_be(addr6.sin6_port),
                addr6.sin6_flowinfo,
                addr6.sin6_scope_id,
            ))
        }
        _ => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
    }
}

/// File status flags of `fd`.
pub(crate) fn status_flags(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}

pub(crate) fn set_status_flags(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })
}

/// Set a file descriptor to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = status_flags(fd)?;
    set_status_flags(fd, flags | libc::O_NONBLOCK)
}
