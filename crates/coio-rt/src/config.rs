// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults suit tests and small servers. `from_env` lets deployments
//! tune them without recompiling.

use std::time::Duration;

/// Tunables for one runtime instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// How long a single readiness poll may block. `None` blocks until an
    /// event arrives.
    pub poll_timeout: Option<Duration>,
    /// Maximum events fetched from epoll per wait.
    pub max_events: usize,
    /// Stack size of the OS thread backing each fiber.
    pub fiber_stack_size: usize,
}

const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
const DEFAULT_MAX_EVENTS: usize = 64;
const DEFAULT_STACK_KB: usize = 256;

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Some(Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS)),
            max_events: DEFAULT_MAX_EVENTS,
            fiber_stack_size: DEFAULT_STACK_KB * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `COIO_POLL_TIMEOUT_MS` (negative = block),
    /// `COIO_MAX_EVENTS` and `COIO_FIBER_STACK_KB`. Unparseable values are
    /// ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<i64>(&lookup, "COIO_POLL_TIMEOUT_MS") {
            config.poll_timeout = if ms < 0 {
                None
            } else {
                Some(Duration::from_millis(ms as u64))
            };
        }
        if let Some(n) = parse_var::<usize>(&lookup, "COIO_MAX_EVENTS") {
            config.max_events = n.max(1);
        }
        if let Some(kb) = parse_var::<usize>(&lookup, "COIO_FIBER_STACK_KB") {
            config.fiber_stack_size = kb.max(16).saturating_mul(1024);
        }

        config
    }

    /// Poll timeout in the form `epoll_wait` expects.
    pub(crate) fn poll_timeout_ms(&self) -> i32 {
        match self.poll_timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}
