// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Dispatcher: the per-step "which fiber next" decision.
//!
//! Priority, fixed:
//! 1. nothing live (or a fatal error recorded) → stop
//! 2. pending spawn → newest first
//! 3. one readiness event → its waiting fiber
//! 4. otherwise idle
//!
//! The only blocking call is the single `poll_next` in step 3.

use std::collections::VecDeque;

use crate::error::{CoError, ContractViolation};
use crate::fiber::FiberId;
use crate::poller::{Multiplexer, Readiness};
use crate::registry::HandleRegistry;

/// Outcome of one scheduling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Stop,
    Resume(FiberId),
    Idle,
}

/// A created fiber that has not run yet.
#[derive(Debug)]
pub(crate) struct PendingSpawn {
    pub fiber: FiberId,
}

/// Mutable scheduler state of one runtime.
#[derive(Debug, Default)]
pub(crate) struct SchedState {
    pub registry: HandleRegistry,
    /// Newest at the front.
    pub pending: VecDeque<PendingSpawn>,
    /// Spawned fibers that have not finished.
    pub live: usize,
    /// First fatal error; stops the loop.
    pub fatal: Option<CoError>,
}

impl SchedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_spawn(&mut self, fiber: FiberId) {
        self.pending.push_front(PendingSpawn { fiber });
        self.live += 1;
    }

    pub fn fiber_finished(&mut self) {
        self.live = self.live.saturating_sub(1);
    }

    /// Keep the first fatal error only; later ones are consequences.
    pub fn record_fatal(&mut self, err: CoError) {
        log::error!("fatal: {}", err);
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }
}

/// Decide the next step.
pub(crate) fn next_step(state: &mut SchedState, poller: &mut dyn Multiplexer) -> Dispatch {
    if state.live == 0 {
        log::trace!("dispatch: no live fibers, stopping");
        return Dispatch::Stop;
    }
    if state.fatal.is_some() {
        log::trace!("dispatch: fatal error recorded, stopping");
        return Dispatch::Stop;
    }

    if let Some(spawn) = state.pending.pop_front() {
        log::trace!("dispatch: starting fiber {}", spawn.fiber);
        return Dispatch::Resume(spawn.fiber);
    }

    let event = match poller.poll_next() {
        Ok(event) => event,
        Err(e) => {
            state.record_fatal(CoError::Poll(e));
            return Dispatch::Stop;
        }
    };

    let fd = match event {
        Readiness::Nothing => return Dispatch::Idle,
        Readiness::Readable(fd) | Readiness::Writable(fd) => fd,
    };

    let Some(handle) = state.registry.find_by_fd(fd) else {
        log::trace!("dispatch: dropping {:?}, descriptor no longer registered", event);
        return Dispatch::Idle;
    };

    match state.registry.take_waiter(handle) {
        Ok(Some(fiber)) => {
            log::trace!("dispatch: {:?} wakes fiber {}", event, fiber);
            Dispatch::Resume(fiber)
        }
        Ok(None) => {
            state.record_fatal(ContractViolation::UnknownWaiter { fd }.into());
            Dispatch::Stop
        }
        Err(v) => {
            state.record_fatal(v.into());
            Dispatch::Stop
        }
    }
}
