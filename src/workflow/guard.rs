//! Rejects a second transition on a record while the first is still running

use std::collections::HashSet;
use std::sync::Mutex;

use uuid::Uuid;

use crate::infra::{LogisticsError, Result};

/// Set of records with a transition in progress
#[derive(Debug, Default)]
pub struct InFlight {
    active: Mutex<HashSet<Uuid>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` until the returned permit is dropped
    pub fn acquire(&self, id: Uuid) -> Result<InFlightPermit<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(id) {
            return Err(LogisticsError::TransitionInFlight(id.to_string()));
        }
        Ok(InFlightPermit { owner: self, id })
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }
}

/// Releases its record on drop
#[derive(Debug)]
pub struct InFlightPermit<'a> {
    owner: &'a InFlight,
    id: Uuid,
}

impl Drop for InFlightPermit<'_> {
    fn drop(&mut self) {
        self.owner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}
