// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Handle registry: open descriptors and the fiber waiting on each.
//!
//! Handles live in an arena of slots addressed by index + generation, so a
//! `Handle` kept after close is detected instead of aliasing a newer one.
//! A descriptor map resolves readiness events back to their handle.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use crate::error::ContractViolation;
use crate::fiber::FiberId;

/// Application-facing key of one open descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle {}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Entry {
    fd: OwnedFd,
    /// Non-owning: the fiber to resume when `fd` becomes ready.
    waiter: Option<FiberId>,
    /// File status flags to put back on close, for descriptors whose open
    /// file description is shared with the rest of the process.
    original_flags: Option<libc::c_int>,
}

/// A descriptor taken out of the registry, still open.
#[derive(Debug)]
pub struct Detached {
    pub fd: OwnedFd,
    pub original_flags: Option<libc::c_int>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// All handles of one runtime.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_fd: HashMap<RawFd, Handle>,
}

/// Registration rejected because the descriptor is already registered.
#[derive(Debug, PartialEq, Eq)]
pub struct AlreadyRegistered(pub RawFd);

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `fd` and return its handle.
    pub fn register(&mut self, fd: OwnedFd) -> Result<Handle, (AlreadyRegistered, OwnedFd)> {
        let raw = fd.as_raw_fd();
        if self.by_fd.contains_key(&raw) {
            return Err((AlreadyRegistered(raw), fd));
        }

        let entry = Entry {
            fd,
            waiter: None,
            original_flags: None,
        };
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                Handle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                Handle {
                    index,
                    generation: 0,
                }
            }
        };

        self.by_fd.insert(raw, handle);
        Ok(handle)
    }

    /// Remove `handle`, returning its still-open descriptor. `None` if the
    /// handle was already released.
    pub fn unregister(&mut self, handle: Handle) -> Option<Detached> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_fd.remove(&entry.fd.as_raw_fd());
        Some(Detached {
            fd: entry.fd,
            original_flags: entry.original_flags,
        })
    }

    /// Remove every handle. Used at shutdown.
    pub fn drain(&mut self) -> Vec<Detached> {
        let handles: Vec<Handle> = self.by_fd.values().copied().collect();
        handles
            .into_iter()
            .filter_map(|handle| self.unregister(handle))
            .collect()
    }

    /// Remember `flags` to be restored when `handle` is closed.
    pub fn set_original_flags(
        &mut self,
        handle: Handle,
        flags: libc::c_int,
    ) -> Result<(), ContractViolation> {
        self.entry_mut(handle)?.original_flags = Some(flags);
        Ok(())
    }

    pub fn find_by_fd(&self, fd: RawFd) -> Option<Handle> {
        self.by_fd.get(&fd).copied()
    }

    /// Descriptor behind a live handle.
    pub fn fd(&self, handle: Handle) -> Result<RawFd, ContractViolation> {
        Ok(self.entry(handle)?.fd.as_raw_fd())
    }

    pub fn waiter(&self, handle: Handle) -> Result<Option<FiberId>, ContractViolation> {
        Ok(self.entry(handle)?.waiter)
    }

    /// Record `fiber` as the only waiter of `handle`.
    pub fn set_waiter(&mut self, handle: Handle, fiber: FiberId) -> Result<RawFd, ContractViolation> {
        let entry = self.entry_mut(handle)?;
        if let Some(waiting) = entry.waiter {
            return Err(ContractViolation::DoubleWait {
                fd: entry.fd.as_raw_fd(),
                waiting,
            });
        }
        entry.waiter = Some(fiber);
        Ok(entry.fd.as_raw_fd())
    }

    /// Clear and return the waiter of `handle`.
    pub fn take_waiter(&mut self, handle: Handle) -> Result<Option<FiberId>, ContractViolation> {
        Ok(self.entry_mut(handle)?.waiter.take())
    }

    pub fn len(&self) -> usize {
        self.by_fd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fd.is_empty()
    }

    fn entry(&self, handle: Handle) -> Result<&Entry, ContractViolation> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(ContractViolation::StaleHandle(handle))
    }

    fn entry_mut(&mut self, handle: Handle) -> Result<&mut Entry, ContractViolation> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(ContractViolation::StaleHandle(handle))
    }
}
