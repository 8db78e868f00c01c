//! Passive signals for the UI: which entities are being re-fetched after a server push, and
//! whether the push transport is connected.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::cache::EntityKey;
use crate::listeners::Listeners;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

#[derive(Default)]
pub(crate) struct ConnectionState {
    status: ConnectionStatus,
    pub(crate) listeners: Listeners<ConnectionStatus>,
}

impl ConnectionState {
    pub(crate) fn get(&self) -> ConnectionStatus {
        self.status
    }

    /// Returns true if the status actually changed.
    pub(crate) fn set(&mut self, status: ConnectionStatus) -> bool {
        if self.status == status {
            return false;
        }
        log::debug!("Connection status {:?} -> {status:?}", self.status);
        self.status = status;
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshingSnapshot {
    /// Bumped on every change, so a poller can tell cheaply whether anything moved.
    pub version: u64,
    pub ids: BTreeMap<String, BTreeSet<String>>,
}

impl RefreshingSnapshot {
    pub fn contains(&self, entity_type: &str, entity_id: &str) -> bool {
        self.ids
            .get(entity_type)
            .is_some_and(|ids| ids.contains(entity_id))
    }
}

/// Entities currently being re-fetched by the merge handler. Overlapping fetches of one entity
/// are counted, and the entity leaves the set only when the last of them finishes.
#[derive(Default)]
pub struct RefreshingEntities {
    snapshot: RefreshingSnapshot,
    in_flight: HashMap<EntityKey, usize>,
    pub(crate) listeners: Listeners<RefreshingSnapshot>,
}

impl RefreshingEntities {
    /// Returns true if the entity was not refreshing before.
    pub fn insert(&mut self, key: &EntityKey) -> bool {
        let count = self.in_flight.entry(key.clone()).or_default();
        *count += 1;
        if *count > 1 {
            return false;
        }
        let added = self
            .snapshot
            .ids
            .entry(key.entity_type.clone())
            .or_default()
            .insert(key.id.clone());
        if added {
            self.snapshot.version += 1;
        }
        added
    }

    /// Returns true if this ended the last fetch of the entity.
    pub fn remove(&mut self, key: &EntityKey) -> bool {
        match self.in_flight.get_mut(key) {
            None => return false,
            Some(count) if *count > 1 => {
                *count -= 1;
                return false;
            }
            Some(_) => {
                self.in_flight.remove(key);
            }
        }
        let Some(ids) = self.snapshot.ids.get_mut(&key.entity_type) else {
            return false;
        };
        let removed = ids.remove(&key.id);
        if ids.is_empty() {
            self.snapshot.ids.remove(&key.entity_type);
        }
        if removed {
            self.snapshot.version += 1;
        }
        removed
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.snapshot.contains(&key.entity_type, &key.id)
    }

    pub fn snapshot(&self) -> RefreshingSnapshot {
        self.snapshot.clone()
    }
}
