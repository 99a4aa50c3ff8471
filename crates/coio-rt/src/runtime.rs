// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bootstrap: build a runtime and drive it until every fiber finished.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::context::Co;
use crate::dispatch::{next_step, Dispatch};
use crate::error::CoError;
use crate::fiber::{FiberCapability, ThreadFibers};
use crate::poller::{EpollPoller, Multiplexer};

/// One scheduler context and the loop that drives it.
pub struct Runtime {
    co: Co,
}

impl Runtime {
    /// Thread-backed fibers over an epoll poller.
    pub fn new(config: RuntimeConfig) -> Result<Self, CoError> {
        let poller = EpollPoller::new(config.poll_timeout_ms(), config.max_events)
            .map_err(CoError::Poll)?;
        let fibers = ThreadFibers::new(config.fiber_stack_size);
        log::debug!("runtime initialised: {:?}", config);
        Ok(Self::with_parts(Arc::new(fibers), Box::new(poller)))
    }

    /// Runtime over caller-supplied collaborators.
    pub fn with_parts(fibers: Arc<dyn FiberCapability>, poller: Box<dyn Multiplexer>) -> Self {
        Self {
            co: Co::new(fibers, poller),
        }
    }

    /// Handle for spawning fibers or adopting descriptors before `run`.
    pub fn handle(&self) -> Co {
        self.co.clone()
    }

    /// Spawn `entry` and run until no fiber is left. Returns the first
    /// fatal error if the loop stopped early. Handles left open are
    /// closed before this returns.
    pub fn run<F>(self, entry: F) -> Result<(), CoError>
    where
        F: FnOnce(&Co) + Send + 'static,
    {
        let shared = self.co.shared.clone();
        self.co.spawn(entry)?;

        shared.fibers.drive(&mut || {
            let mut state = shared.state.lock();
            let mut poller = shared.poller.lock();
            match next_step(&mut state, &mut **poller) {
                Dispatch::Stop => {
                    shared.fibers.stop();
                    None
                }
                Dispatch::Resume(fiber) => Some(fiber),
                Dispatch::Idle => None,
            }
        });
        self.co.shutdown();

        let mut state = shared.state.lock();
        log::debug!(
            "run loop finished ({} live, {} handles open)",
            state.live,
            state.registry.len()
        );
        match state.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A runtime dropped without `run` still releases the fibers spawned
/// through its handle and closes what they registered.
impl Drop for Runtime {
    fn drop(&mut self) {
        self.co.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::ScriptedPoller;
    use parking_lot::Mutex;

    fn scripted_runtime() -> Runtime {
        Runtime::with_parts(
            Arc::new(ThreadFibers::new(256 * 1024)),
            Box::new(ScriptedPoller::default()),
        )
    }

    #[test]
    fn run_returns_after_entry_finishes() {
        let ran = Arc::new(Mutex::new(false));
        let r = ran.clone();
        scripted_runtime().run(move |_| *r.lock() = true).unwrap();
        assert!(*ran.lock());
    }

    #[test]
    fn nested_spawns_run_newest_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        scripted_runtime()
            .run(move |co| {
                for i in 0..4 {
                    let o = o.clone();
                    co.spawn(move |_| o.lock().push(i)).unwrap();
                }
            })
            .unwrap();
        assert_eq!(*order.lock(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn panic_in_fiber_is_reported() {
        let err = scripted_runtime()
            .run(|_| panic!("boom"))
            .unwrap_err();
        match err {
            CoError::FiberPanicked(msg) => assert!(msg.contains("boom")),
            other => panic!("expected FiberPanicked, got {:?}", other),
        }
    }

    #[test]
    fn spawn_before_run_is_started_after_entry() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let rt = scripted_runtime();

        let o = order.clone();
        rt.handle().spawn(move |_| o.lock().push("early")).unwrap();
        let o = order.clone();
        rt.run(move |_| o.lock().push("entry")).unwrap();

        assert_eq!(*order.lock(), vec!["entry", "early"]);
    }

    #[test]
    fn dropping_unrun_runtime_releases_spawned_entries() {
        let token = Arc::new(());
        let held = token.clone();
        let rt = scripted_runtime();
        let co = rt.handle();
        co.spawn(move |_| drop(held)).unwrap();
        assert_eq!(Arc::strong_count(&token), 2);

        drop(rt);
        assert_eq!(Arc::strong_count(&token), 1);
        assert!(co.spawn(|_| {}).is_err());
    }
}
