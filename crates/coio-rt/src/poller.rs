// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness multiplexer: epoll-backed event source.
//!
//! Interest is one-shot: a watched descriptor reports at most one event,
//! then stays silent until it is watched again. Events are handed out one
//! per `poll_next` call; a single `epoll_wait` may fill a small backlog.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Which readiness a fiber is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        let base = match self {
            Interest::Readable => libc::EPOLLIN,
            Interest::Writable => libc::EPOLLOUT,
        };
        (base | libc::EPOLLONESHOT) as u32
    }
}

/// One result of `poll_next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Nothing,
    Readable(RawFd),
    Writable(RawFd),
}

impl Readiness {
    fn new(fd: RawFd, interest: Interest) -> Self {
        match interest {
            Interest::Readable => Readiness::Readable(fd),
            Interest::Writable => Readiness::Writable(fd),
        }
    }

    pub fn fd(self) -> Option<RawFd> {
        match self {
            Readiness::Nothing => None,
            Readiness::Readable(fd) | Readiness::Writable(fd) => Some(fd),
        }
    }
}

/// OS readiness source, as consumed by the scheduler.
pub trait Multiplexer: Send {
    /// Report `fd` once when it becomes ready for `interest`.
    fn watch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Drop any interest in `fd` and any event for it not yet handed out.
    /// Called before the descriptor is closed.
    fn forget(&mut self, fd: RawFd);

    /// Next readiness event, or `Nothing` if none arrived in time.
    fn poll_next(&mut self) -> io::Result<Readiness>;

    fn watch_readable(&mut self, fd: RawFd) -> io::Result<()> {
        self.watch(fd, Interest::Readable)
    }

    fn watch_writable(&mut self, fd: RawFd) -> io::Result<()> {
        self.watch(fd, Interest::Writable)
    }
}

/// Level-triggered, one-shot epoll poller.
pub struct EpollPoller {
    epoll: OwnedFd,
    /// fd → interest of its current (or last) registration.
    interests: HashMap<RawFd, Interest>,
    /// Events fetched but not handed out yet.
    backlog: VecDeque<Readiness>,
    /// Reused `epoll_wait` output buffer.
    events: Vec<libc::epoll_event>,
    timeout_ms: i32,
}

impl EpollPoller {
    /// `timeout_ms` of -1 blocks each poll until an event arrives.
    pub fn new(timeout_ms: i32, max_events: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(epoll_fd) },
            interests: HashMap::new(),
            backlog: VecDeque::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
            timeout_ms,
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Multiplexer for EpollPoller {
    fn watch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let events = interest.to_epoll_events();

        // Known fds were ADDed before; a one-shot registration stays in the
        // set after firing, so MOD re-arms it. The kernel may disagree after
        // descriptor reuse, hence the fallbacks.
        let first = if self.interests.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };

        let result = match self.ctl(first, fd, events) {
            Err(e) if first == libc::EPOLL_CTL_MOD && e.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, events)
            }
            Err(e) if first == libc::EPOLL_CTL_ADD && e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, events)
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.interests.insert(fd, interest);
                Ok(())
            }
            // Regular files cannot be polled; they are always ready.
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                self.backlog.push_back(Readiness::new(fd, interest));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn forget(&mut self, fd: RawFd) {
        self.backlog.retain(|ev| ev.fd() != Some(fd));
        if self.interests.remove(&fd).is_some() {
            if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
                // ENOENT / EBADF are expected if the fd is already gone.
                if e.raw_os_error() != Some(libc::ENOENT) && e.raw_os_error() != Some(libc::EBADF) {
                    log::warn!("epoll: failed to forget fd {}: {}", fd, e);
                }
            }
        }
    }

    fn poll_next(&mut self) -> io::Result<Readiness> {
        if let Some(ev) = self.backlog.pop_front() {
            return Ok(ev);
        }

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                self.timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::Nothing);
            }
            return Err(err);
        }

        for ev in &self.events[..n as usize] {
            let fd = ev.u64 as RawFd;
            // Error/hangup conditions are reported under whatever the fd
            // was waiting for; the raw operation surfaces the details.
            match self.interests.get(&fd) {
                Some(&interest) => self.backlog.push_back(Readiness::new(fd, interest)),
                None => log::trace!("epoll: event for unwatched fd {}", fd),
            }
        }

        Ok(self.backlog.pop_front().unwrap_or(Readiness::Nothing))
    }
}
