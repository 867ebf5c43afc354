//! Bookkeeping for named savepoints inside one transaction.
//!
//! The coordinator only tracks markers; the handle issues the statements and
//! updates the coordinator once the link accepted them.

use super::error::SavepointError;
use crate::sql::is_identifier;

/// A live savepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavepointMarker {
    pub name: String,
    /// Id of the transaction that created it.
    pub owner: String,
    /// Creation order within the owning transaction.
    pub sequence: u64,
}

/// Live savepoints of one transaction, oldest first.
#[derive(Debug, Default)]
pub struct SavepointCoordinator {
    markers: Vec<SavepointMarker>,
    sequence: u64,
}

impl SavepointCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail unless `name` is a valid identifier not used by a live marker.
    pub fn check_available(&self, name: &str, owner: &str) -> Result<(), SavepointError> {
        if !is_identifier(name) {
            return Err(SavepointError::InvalidName(name.to_string()));
        }
        if self.markers.iter().any(|m| m.name == name) {
            return Err(SavepointError::Duplicate {
                name: name.to_string(),
                tx_id: owner.to_string(),
            });
        }
        Ok(())
    }

    /// Record a savepoint the link has accepted.
    pub fn register(&mut self, name: &str, owner: &str) -> SavepointMarker {
        self.sequence += 1;
        let marker = SavepointMarker {
            name: name.to_string(),
            owner: owner.to_string(),
            sequence: self.sequence,
        };
        self.markers.push(marker.clone());
        marker
    }

    /// A name no live marker uses, for implicit NESTED scopes.
    pub fn generate_name(&self) -> String {
        let mut seq = self.sequence + 1;
        loop {
            let name = format!("nested_{}", seq);
            if !self.markers.iter().any(|m| m.name == name) {
                return name;
            }
            seq += 1;
        }
    }

    /// Position of the live marker called `name`.
    pub fn lookup(&self, name: &str, owner: &str) -> Result<usize, SavepointError> {
        if !is_identifier(name) {
            return Err(SavepointError::InvalidName(name.to_string()));
        }
        self.markers
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| SavepointError::Unknown {
                name: name.to_string(),
                tx_id: owner.to_string(),
            })
    }

    /// Invalidate every marker created after `name`. `name` stays live.
    pub fn rollback_to(&mut self, name: &str, owner: &str) -> Result<(), SavepointError> {
        let index = self.lookup(name, owner)?;
        self.markers.truncate(index + 1);
        Ok(())
    }

    /// Drop `name` and every marker created after it.
    pub fn release(&mut self, name: &str, owner: &str) -> Result<(), SavepointError> {
        let index = self.lookup(name, owner)?;
        self.markers.truncate(index);
        Ok(())
    }

    /// Invalidate everything; called when the transaction finalizes.
    pub fn clear(&mut self) {
        self.markers.clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.markers.iter().map(|m| m.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}
