// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber capability: the execution units the scheduler multiplexes.
//!
//! The scheduler only talks to `FiberCapability`. `ThreadFibers` is the
//! default implementation: every fiber is an OS thread, and a baton
//! (mutex + condvar) guarantees that exactly one of {driver, one fiber}
//! runs at any instant. A fiber only runs while the baton names it, and
//! that holds during shutdown too: leftover fibers are released one by
//! one.

use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

/// Identity of one fiber, unique for the lifetime of its capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Entry point of a fiber. Arguments travel as closure captures.
pub type FiberEntry = Box<dyn FnOnce() + Send + 'static>;

/// Cooperative execution units, as consumed by the scheduler.
pub trait FiberCapability: Send + Sync {
    /// Create a suspended fiber bound to `entry`. It first runs when
    /// `resume` is called with the returned id.
    fn create(&self, entry: FiberEntry) -> io::Result<FiberId>;

    /// The fiber executing the caller, or `None` on the driver.
    fn current(&self) -> Option<FiberId>;

    /// Park the calling fiber and hand control back to the driver.
    /// Returns once the driver resumes this fiber.
    fn suspend(&self);

    /// Run `id` until it suspends or finishes. Driver side only.
    fn resume(&self, id: FiberId);

    /// Ask `drive` to return after the current step.
    fn stop(&self);

    /// Driver loop: repeatedly ask `next` which fiber to resume (`None`
    /// means nothing is runnable this step) until `stop` is called, then
    /// `shutdown`.
    fn drive(&self, next: &mut dyn FnMut() -> Option<FiberId>);

    /// Release every fiber that has not finished, one at a time. Parked
    /// fibers unwind with `Released`; unstarted ones drop their entry
    /// without running it. Returns once all are gone. Idempotent.
    fn shutdown(&self);
}

/// Unwind payload that releases fibers still parked when the driver
/// loop ends. Never observed by application code unless it catches
/// unwinds itself.
#[derive(Debug)]
pub struct Released;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Driver,
    Fiber(FiberId),
    /// `id` is leaving without running further.
    Release(FiberId),
    Closed,
}

/// What a waiting fiber was woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Run,
    Release,
}

struct Baton {
    turn: Turn,
    /// Fibers whose thread has not exited yet.
    alive: HashSet<FiberId>,
}

struct Inner {
    baton: Mutex<Baton>,
    turn_changed: Condvar,
    next_id: AtomicU64,
    stop_requested: AtomicBool,
    stack_size: usize,
}

thread_local! {
    static CURRENT: Cell<Option<FiberId>> = const { Cell::new(None) };
}

/// Thread-backed fibers with strict turn passing.
#[derive(Clone)]
pub struct ThreadFibers {
    inner: Arc<Inner>,
}

impl ThreadFibers {
    pub fn new(stack_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                baton: Mutex::new(Baton {
                    turn: Turn::Driver,
                    alive: HashSet::new(),
                }),
                turn_changed: Condvar::new(),
                next_id: AtomicU64::new(1),
                stop_requested: AtomicBool::new(false),
                stack_size,
            }),
        }
    }

    /// Number of fibers whose backing thread is still around.
    pub fn alive(&self) -> usize {
        self.inner.baton.lock().alive.len()
    }

    /// Hand a release turn to each remaining fiber in id order and wait
    /// for its thread to leave before the next. Fibers created while this
    /// runs (from a `Drop` of a released one) are picked up as well.
    fn release_all(&self) {
        let mut baton = self.inner.baton.lock();
        if !baton.alive.is_empty() {
            log::debug!("releasing {} unfinished fiber(s)", baton.alive.len());
        }
        loop {
            let Some(id) = baton.alive.iter().min().copied() else {
                break;
            };
            baton.turn = Turn::Release(id);
            self.inner.turn_changed.notify_all();
            while baton.alive.contains(&id) {
                self.inner.turn_changed.wait(&mut baton);
            }
        }
        baton.turn = Turn::Closed;
        self.inner.turn_changed.notify_all();
    }
}

impl Inner {
    /// Block until the baton names `id`.
    fn wait_for_turn(&self, id: FiberId) -> Wake {
        let mut baton = self.baton.lock();
        loop {
            match baton.turn {
                Turn::Fiber(t) if t == id => return Wake::Run,
                Turn::Release(t) if t == id => return Wake::Release,
                _ => self.turn_changed.wait(&mut baton),
            }
        }
    }
}

/// Hands the baton back and deregisters the fiber when its thread ends,
/// whether the entry returned or unwound.
struct ExitGuard {
    inner: Arc<Inner>,
    id: FiberId,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut baton = self.inner.baton.lock();
        baton.alive.remove(&self.id);
        if baton.turn == Turn::Fiber(self.id) || baton.turn == Turn::Release(self.id) {
            baton.turn = Turn::Driver;
        }
        self.inner.turn_changed.notify_all();
    }
}

impl FiberCapability for ThreadFibers {
    fn create(&self, entry: FiberEntry) -> io::Result<FiberId> {
        let id = FiberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut baton = self.inner.baton.lock();
            if baton.turn == Turn::Closed {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "fibers already shut down",
                ));
            }
            baton.alive.insert(id);
        }

        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("coio-fiber-{}", id.0))
            .stack_size(self.inner.stack_size)
            .spawn(move || {
                CURRENT.with(|c| c.set(Some(id)));
                let _exit = ExitGuard {
                    inner: inner.clone(),
                    id,
                };
                if inner.wait_for_turn(id) == Wake::Release {
                    // Captures are dropped under this fiber's turn.
                    drop(entry);
                    return;
                }
                // Panics were already reported by the entry wrapper;
                // `Released` lands here too.
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
            });

        match spawned {
            Ok(_) => Ok(id),
            Err(e) => {
                let mut baton = self.inner.baton.lock();
                baton.alive.remove(&id);
                self.inner.turn_changed.notify_all();
                Err(e)
            }
        }
    }

    fn current(&self) -> Option<FiberId> {
        CURRENT.with(|c| c.get())
    }

    fn suspend(&self) {
        let Some(id) = self.current() else {
            log::warn!("suspend called outside of a fiber; ignoring");
            return;
        };

        {
            let mut baton = self.inner.baton.lock();
            if baton.turn == Turn::Fiber(id) {
                baton.turn = Turn::Driver;
            }
            self.inner.turn_changed.notify_all();
        }

        if self.inner.wait_for_turn(id) == Wake::Release {
            std::panic::resume_unwind(Box::new(Released));
        }
    }

    fn resume(&self, id: FiberId) {
        let mut baton = self.inner.baton.lock();
        if !baton.alive.contains(&id) {
            log::warn!("resume of finished or unknown fiber {}", id);
            return;
        }
        if baton.turn == Turn::Closed {
            return;
        }

        baton.turn = Turn::Fiber(id);
        self.inner.turn_changed.notify_all();
        while baton.turn == Turn::Fiber(id) {
            self.inner.turn_changed.wait(&mut baton);
        }
    }

    fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::Release);
    }

    fn drive(&self, next: &mut dyn FnMut() -> Option<FiberId>) {
        while !self.inner.stop_requested.load(Ordering::Acquire) {
            if let Some(id) = next() {
                self.resume(id);
            }
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        self.release_all();
    }
}
