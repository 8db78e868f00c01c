//! Short-lived per-entity markers used to recognise echoes: server pushes that only report back
//! a change this client just made. Markers decide whether to skip a refetch; nothing
//! correctness-critical depends on them.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::cache::EntityKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityMutationMarker {
    pub client_mutation_id: String,
    pub marked_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct EchoTracker {
    markers: HashMap<EntityKey, EntityMutationMarker>,
    window: TimeDelta,
}

impl Default for EchoTracker {
    fn default() -> Self {
        Self::new(TimeDelta::milliseconds(5000))
    }
}

impl EchoTracker {
    pub fn new(window: TimeDelta) -> Self {
        Self {
            markers: HashMap::new(),
            window,
        }
    }

    /// Mark `key` as just written. Markers for other entities that have outlived the window are
    /// dropped on the way, so the map only holds entities touched recently.
    pub fn mark_mutated(
        &mut self,
        key: EntityKey,
        client_mutation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.prune_expired(now);
        self.markers.insert(
            key,
            EntityMutationMarker {
                client_mutation_id: client_mutation_id.into(),
                marked_at: now,
            },
        );
    }

    /// Replace the in-flight marker with one stamped at commit time, so the server's echo of the
    /// committed write is still recognised for a full window.
    pub fn mark_committed(
        &mut self,
        key: EntityKey,
        client_mutation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.mark_mutated(key, client_mutation_id, now);
    }

    pub fn clear_mutated(&mut self, key: &EntityKey) -> Option<EntityMutationMarker> {
        self.markers.remove(key)
    }

    pub fn marker(&self, key: &EntityKey) -> Option<&EntityMutationMarker> {
        self.markers.get(key)
    }

    /// True when the entity has a marker and either the notification carries the marked
    /// correlation id, or the marker is younger than the window.
    pub fn is_likely_echo(
        &self,
        key: &EntityKey,
        incoming_mutation_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(marker) = self.markers.get(key) else {
            return false;
        };
        if incoming_mutation_id == Some(marker.client_mutation_id.as_str()) {
            return true;
        }
        now - marker.marked_at < self.window
    }

    /// Drop markers older than the window. Returns how many were removed.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.markers.len();
        let window = self.window;
        self.markers
            .retain(|_, marker| now - marker.marked_at < window);
        before - self.markers.len()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}
