// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler context and the application-facing `Co` handle.
//!
//! One `Shared` per runtime: fiber capability, multiplexer, and scheduler
//! state. Only the turn holder (driver or one fiber) touches it, so the
//! mutexes are never contended; they exist so the thread-backed fibers
//! can share it. No lock is held across a suspension.

use std::any::Any;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatch::SchedState;
use crate::error::{CoError, ContractViolation};
use crate::fiber::{FiberCapability, FiberId, Released};
use crate::poller::Multiplexer;
use crate::registry::Handle;

pub(crate) struct Shared {
    pub fibers: Arc<dyn FiberCapability>,
    pub poller: Mutex<Box<dyn Multiplexer>>,
    pub state: Mutex<SchedState>,
}

/// Cheap, cloneable reference to a runtime. Every fiber entry receives
/// one; all spawning and I/O goes through it.
#[derive(Clone)]
pub struct Co {
    pub(crate) shared: Arc<Shared>,
}

impl Co {
    pub(crate) fn new(fibers: Arc<dyn FiberCapability>, poller: Box<dyn Multiplexer>) -> Self {
        Self {
            shared: Arc::new(Shared {
                fibers,
                poller: Mutex::new(poller),
                state: Mutex::new(SchedState::new()),
            }),
        }
    }

    /// Queue a new fiber running `entry`. It starts ahead of every fiber
    /// spawned before it that has not started yet.
    pub fn spawn<F>(&self, entry: F) -> Result<(), CoError>
    where
        F: FnOnce(&Co) + Send + 'static,
    {
        let co = self.clone();
        let wrapper = move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry(&co)));
            if let Err(payload) = outcome {
                if payload.is::<Released>() {
                    std::panic::resume_unwind(payload);
                }
                co.shared
                    .state
                    .lock()
                    .record_fatal(CoError::FiberPanicked(panic_message(&*payload)));
            }

            let mut state = co.shared.state.lock();
            state.fiber_finished();
            log::trace!("fiber finished ({} live)", state.live);
        };

        let fiber = self
            .shared
            .fibers
            .create(Box::new(wrapper))
            .map_err(CoError::Spawn)?;

        let mut state = self.shared.state.lock();
        state.push_spawn(fiber);
        log::debug!("spawned fiber {} ({} live)", fiber, state.live);
        Ok(())
    }

    /// The fiber calling this, if any.
    pub fn current(&self) -> Option<FiberId> {
        self.shared.fibers.current()
    }

    /// Number of handles currently open on this runtime.
    pub fn open_handles(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    /// Number of spawned fibers that have not finished.
    pub fn live_fibers(&self) -> usize {
        self.shared.state.lock().live
    }

    /// Record a broken invariant so the dispatcher stops, and hand the
    /// error back to the caller.
    pub(crate) fn violation(&self, v: ContractViolation) -> CoError {
        self.fatal(v.into())
    }

    pub(crate) fn fatal(&self, err: CoError) -> CoError {
        if let Some(copy) = err.duplicate_fatal() {
            self.shared.state.lock().record_fatal(copy);
        }
        err
    }

    /// Take ownership of `fd` in the registry.
    pub(crate) fn register(&self, fd: OwnedFd) -> Result<Handle, CoError> {
        let raw = fd.as_raw_fd();
        let registered = self.shared.state.lock().registry.register(fd);
        match registered {
            Ok(handle) => Ok(handle),
            Err((_, alias)) => {
                // Another handle owns this descriptor number; closing the
                // alias would close theirs.
                std::mem::forget(alias);
                Err(CoError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("descriptor {} is already registered", raw),
                )))
            }
        }
    }

    /// End of a runtime: release unfinished fibers, then close every
    /// handle still registered. Safe to call more than once.
    pub(crate) fn shutdown(&self) {
        self.shared.fibers.shutdown();

        let leftover = self.shared.state.lock().registry.drain();
        if !leftover.is_empty() {
            log::debug!("closing {} handle(s) left open", leftover.len());
        }
        for detached in leftover {
            self.release(detached);
        }
    }

    /// Descriptor of a live handle.
    pub(crate) fn fd_of(&self, handle: Handle) -> Result<RawFd, CoError> {
        let fd = self.shared.state.lock().registry.fd(handle);
        fd.map_err(|v| self.violation(v))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
