// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use thiserror::Error;

use crate::fiber::FiberId;
use crate::registry::Handle;

/// A broken scheduling invariant. Never recoverable: the run loop stops
/// and `Runtime::run` reports the first one recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("fiber {waiting} is already waiting on descriptor {fd}")]
    DoubleWait { fd: RawFd, waiting: FiberId },

    #[error("descriptor {fd} became ready but no fiber is waiting on it")]
    UnknownWaiter { fd: RawFd },

    #[error("{0} was used after it was closed")]
    StaleHandle(Handle),

    #[error("blocking I/O called outside of a fiber")]
    NotInFiber,
}

/// Errors produced by the runtime and its I/O primitives.
#[derive(Debug, Error)]
pub enum CoError {
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("failed to open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("no IPv4 address found for {host}")]
    NoIpv4Address { host: String },

    #[error("failed to create socket: {0}")]
    Socket(io::Error),

    #[error("connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: io::Error },

    #[error("bind to {addr} failed: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to create fiber: {0}")]
    Spawn(io::Error),

    #[error("fiber panicked: {0}")]
    FiberPanicked(String),

    #[error("readiness poll failed: {0}")]
    Poll(io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CoError {
    /// Fatal errors stop the run loop; everything else is the caller's to
    /// handle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoError::Contract(_) | CoError::FiberPanicked(_) | CoError::Poll(_)
        )
    }

    /// The contract violation behind this error, if any.
    pub fn as_contract(&self) -> Option<&ContractViolation> {
        match self {
            CoError::Contract(v) => Some(v),
            _ => None,
        }
    }

    /// Copy of a fatal error, kept on the context while the original goes
    /// back to the fiber that hit it. `io::Error` is not `Clone`, so the
    /// OS error is rebuilt from its kind and message.
    pub(crate) fn duplicate_fatal(&self) -> Option<CoError> {
        match self {
            CoError::Contract(v) => Some(CoError::Contract(v.clone())),
            CoError::FiberPanicked(msg) => Some(CoError::FiberPanicked(msg.clone())),
            CoError::Poll(e) => Some(CoError::Poll(io::Error::new(e.kind(), e.to_string()))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_errors_are_fatal() {
        let err: CoError = ContractViolation::NotInFiber.into();
        assert!(err.is_fatal());
        assert_eq!(err.as_contract(), Some(&ContractViolation::NotInFiber));
    }

    #[test]
    fn resource_errors_are_not_fatal() {
        let err = CoError::NoIpv4Address {
            host: "example.invalid".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(err.duplicate_fatal().is_none());
    }

    #[test]
    fn double_wait_message_names_descriptor() {
        let err = ContractViolation::DoubleWait {
            fd: 7,
            waiting: FiberId(3),
        };
        assert_eq!(
            err.to_string(),
            "fiber #3 is already waiting on descriptor 7"
        );
    }

    #[test]
    fn poll_error_duplicates_with_kind() {
        let err = CoError::Poll(io::Error::from(io::ErrorKind::Interrupted));
        let copy = err.duplicate_fatal().unwrap();
        match copy {
            CoError::Poll(e) => assert_eq!(e.kind(), io::ErrorKind::Interrupted),
            other => panic!("expected Poll, got {:?}", other),
        }
    }
}
