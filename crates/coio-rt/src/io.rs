// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking-style I/O primitives.
//!
//! Each call looks synchronous to the fiber making it. Underneath, the
//! fiber records itself as the handle's only waiter, registers interest,
//! and suspends; the dispatcher resumes it when the descriptor is ready,
//! and the raw operation runs once. Its result is returned as the OS
//! reported it: `Ok(0)` is end of stream, errors are `CoError::Io`.
//!
//! Readiness is trusted after wake. `wait_ready` is the only place that
//! would need to change to revalidate it.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::context::Co;
use crate::error::{CoError, ContractViolation};
use crate::net;
use crate::poller::Interest;
use crate::registry::{Detached, Handle};

/// Access mode for `Co::open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read only.
    ReadOnly,
    /// Created if missing, truncated.
    WriteOnly,
    /// Created if missing, not truncated.
    ReadWrite,
    /// Created if missing, every write goes to the end.
    Append,
}

impl OpenMode {
    fn options(self, permissions: u32) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            OpenMode::ReadOnly => opts.read(true),
            OpenMode::WriteOnly => opts.write(true).create(true).truncate(true),
            OpenMode::ReadWrite => opts.read(true).write(true).create(true),
            OpenMode::Append => opts.append(true).create(true),
        };
        opts.mode(permissions).custom_flags(libc::O_NONBLOCK);
        opts
    }
}

/// Write formatted text to a handle from inside a fiber.
///
/// ```ignore
/// co_write!(co, out, "{} bytes from {}\n", n, peer)?;
/// ```
#[macro_export]
macro_rules! co_write {
    ($co:expr, $handle:expr, $($arg:tt)*) => {
        $co.write_fmt($handle, ::std::format_args!($($arg)*))
    };
}

impl Co {
    /// Park the calling fiber until `handle` is ready for `interest`.
    fn wait_ready(&self, handle: Handle, interest: Interest) -> Result<RawFd, CoError> {
        let Some(me) = self.current() else {
            return Err(self.violation(ContractViolation::NotInFiber));
        };

        let claimed = self.shared.state.lock().registry.set_waiter(handle, me);
        let fd = claimed.map_err(|v| self.violation(v))?;

        let watched = self.shared.poller.lock().watch(fd, interest);
        if let Err(e) = watched {
            let _ = self.shared.state.lock().registry.take_waiter(handle);
            return Err(CoError::Io(e));
        }

        log::trace!("fiber {} waits for {:?} on fd {}", me, interest, fd);
        self.shared.fibers.suspend();
        Ok(fd)
    }

    /// Read up to `buf.len()` bytes once `handle` is readable.
    pub fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, CoError> {
        let fd = self.wait_ready(handle, Interest::Readable)?;
        raw_read(fd, buf)
    }

    /// Write up to `buf.len()` bytes once `handle` is writable.
    pub fn write(&self, handle: Handle, buf: &[u8]) -> Result<usize, CoError> {
        let fd = self.wait_ready(handle, Interest::Writable)?;
        raw_write(fd, buf)
    }

    /// Write all of `buf`, suspending as often as needed.
    pub fn write_all(&self, handle: Handle, mut buf: &[u8]) -> Result<(), CoError> {
        while !buf.is_empty() {
            match self.write(handle, buf)? {
                0 => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Formatted write built on `write`. Returns the number of bytes
    /// written, which is the whole formatted text on success.
    pub fn write_fmt(&self, handle: Handle, args: fmt::Arguments<'_>) -> Result<usize, CoError> {
        let text = fmt::format(args);
        self.write_all(handle, text.as_bytes())?;
        Ok(text.len())
    }

    /// Open `path` with the access flags of `mode`. `permissions` applies
    /// when the file is created.
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        mode: OpenMode,
        permissions: u32,
    ) -> Result<Handle, CoError> {
        let path = path.as_ref();
        let file = match mode.options(permissions).open(path) {
            Ok(file) => file,
            Err(source) => {
                log::warn!("open {} failed: {}", path.display(), source);
                return Err(CoError::Open {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let handle = self.register(file.into())?;
        log::debug!("opened {} ({:?}) as {}", path.display(), mode, handle);
        Ok(handle)
    }

    /// Register an already open descriptor, switching it to non-blocking.
    pub fn adopt(&self, fd: OwnedFd) -> Result<Handle, CoError> {
        net::set_nonblocking(fd.as_raw_fd())?;
        self.register(fd)
    }

    /// A handle on a duplicate of standard output.
    ///
    /// The duplicate shares the file status flags of the original, so
    /// standard output is non-blocking for the whole process while the
    /// handle is open. Closing it (or shutdown) puts the flags back.
    pub fn stdout(&self) -> Result<Handle, CoError> {
        let dup = io::stdout().as_fd().try_clone_to_owned()?;
        let original = net::status_flags(dup.as_raw_fd())?;
        let handle = self.adopt(dup)?;

        if original & libc::O_NONBLOCK == 0 {
            let recorded = self
                .shared
                .state
                .lock()
                .registry
                .set_original_flags(handle, original);
            recorded.map_err(|v| self.violation(v))?;
        }
        Ok(handle)
    }

    /// Unregister and close `handle`. `None` is a no-op.
    pub fn close(&self, handle: impl Into<Option<Handle>>) {
        let Some(handle) = handle.into() else {
            return;
        };

        let detached = {
            let mut state = self.shared.state.lock();
            if let Ok(Some(waiter)) = state.registry.waiter(handle) {
                log::warn!("closing {} while fiber {} waits on it", handle, waiter);
            }
            state.registry.unregister(handle)
        };

        match detached {
            Some(detached) => {
                let raw = self.release(detached);
                log::debug!("closed {} (fd {})", handle, raw);
            }
            None => log::warn!("close of {} ignored: already closed", handle),
        }
    }

    /// Forget multiplexer interest, restore shared flags, and close.
    pub(crate) fn release(&self, detached: Detached) -> RawFd {
        let raw = detached.fd.as_raw_fd();
        self.shared.poller.lock().forget(raw);
        if let Some(flags) = detached.original_flags {
            if let Err(e) = net::set_status_flags(raw, flags) {
                log::warn!("failed to restore flags of fd {}: {}", raw, e);
            }
        }
        drop(detached.fd);
        raw
    }

    /// Connect to `host:port` over IPv4, suspending while the connection
    /// is in progress.
    pub fn connect_tcp(&self, host: &str, port: u16) -> Result<Handle, CoError> {
        let addr = match net::resolve_ipv4(host, port) {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("connect_tcp {}:{} failed: {}", host, port, e);
                return Err(e);
            }
        };
        let sock = net::tcp_socket().map_err(CoError::Socket)?;
        let handle = self.register(sock)?;

        loop {
            let fd = self.fd_of(handle)?;
            match net::connect(fd, &addr) {
                Ok(()) => break,
                Err(e) if net::already_connected(&e) => break,
                Err(e) if net::connect_in_progress(&e) => {
                    if let Err(err) = self.wait_ready(handle, Interest::Writable) {
                        self.close(handle);
                        return Err(err);
                    }
                }
                Err(source) => {
                    log::warn!("connect_tcp {} failed: {}", addr, source);
                    self.close(handle);
                    return Err(CoError::Connect {
                        addr: addr.into(),
                        source,
                    });
                }
            }
        }

        log::debug!("connected to {} as {}", addr, handle);
        Ok(handle)
    }

    /// Bind and listen on `host:port` over IPv4. Pure setup: never
    /// suspends.
    pub fn bind_tcp(&self, host: &str, port: u16, backlog: i32) -> Result<Handle, CoError> {
        let addr = match net::resolve_ipv4(host, port) {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("bind_tcp {}:{} failed: {}", host, port, e);
                return Err(e);
            }
        };
        let sock = net::tcp_socket().map_err(CoError::Socket)?;

        if let Err(source) = net::bind_listen(sock.as_raw_fd(), &addr, backlog) {
            log::warn!("bind_tcp {} failed: {}", addr, source);
            return Err(CoError::Bind {
                addr: addr.into(),
                source,
            });
        }

        let handle = self.register(sock)?;
        log::debug!("listening on {} as {}", addr, handle);
        Ok(handle)
    }

    /// Wait for a connection on `listener` and register it as a new handle.
    pub fn accept(&self, listener: Handle) -> Result<(Handle, SocketAddr), CoError> {
        let fd = self.wait_ready(listener, Interest::Readable)?;
        let (client, peer) = net::accept(fd)?;
        let handle = self.register(client)?;
        log::debug!("accepted {} as {}", peer, handle);
        Ok((handle, peer))
    }

    /// Address a bound or connected socket handle uses locally.
    pub fn local_addr(&self, handle: Handle) -> Result<SocketAddr, CoError> {
        let fd = self.fd_of(handle)?;
        Ok(net::local_addr(fd)?)
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> Result<usize, CoError> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(n as usize)
}

fn raw_write(fd: RawFd, buf: &[u8]) -> Result<usize, CoError> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(n as usize)
}
