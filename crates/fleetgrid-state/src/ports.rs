//! Host-wide port ledger.
//!
//! Every group allocates from its own range, but ranges may overlap, so
//! ownership is tracked per host port rather than per group.

use std::collections::HashMap;

use crate::types::{InstanceId, PortRange};

/// Tracks which instance holds each allocated host port.
#[derive(Debug, Default)]
pub struct PortLedger {
    owners: HashMap<u16, InstanceId>,
}

impl PortLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the lowest free port of `range` for `owner`.
    pub fn allocate(&mut self, range: PortRange, owner: &str) -> Option<u16> {
        if range.is_empty() {
            return None;
        }
        let port = (range.start..=range.end).find(|p| !self.owners.contains_key(p))?;
        self.owners.insert(port, owner.to_string());
        Some(port)
    }

    /// Reserve a specific port. Fails if another instance holds it.
    pub fn claim(&mut self, port: u16, owner: &str) -> bool {
        match self.owners.get(&port) {
            Some(current) => current == owner,
            None => {
                self.owners.insert(port, owner.to_string());
                true
            }
        }
    }

    /// Release `port` if `owner` holds it.
    pub fn release(&mut self, port: u16, owner: &str) -> bool {
        if self.owners.get(&port).is_some_and(|o| o == owner) {
            self.owners.remove(&port);
            true
        } else {
            false
        }
    }

    pub fn owner(&self, port: u16) -> Option<&str> {
        self.owners.get(&port).map(String::as_str)
    }

    pub fn in_use(&self) -> usize {
        self.owners.len()
    }
}
