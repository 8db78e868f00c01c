//! In-memory mirror of outstanding mutations: the single source of truth for "is entity X
//! currently being mutated". Every read is synchronous, so it always reflects the queue at call
//! time. The durable copy is a separate store that the engine keeps in step explicitly.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::transport::Operation;

/// One outstanding mutation, as persisted in the outbox.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PendingMutationRecord {
    pub client_mutation_id: String,
    /// What to re-send.
    pub operation: Operation,
    pub variables: Value,
    /// Looked up in the plan registry on replay.
    pub plan_key: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingMutationRecord {
    pub fn target_id<'a>(&'a self, target_id_field: &str) -> Option<&'a str> {
        self.variables.get(target_id_field)?.as_str()
    }

    /// Whether this record mutates `entity_type:entity_id`. Records that were created without an
    /// entity type match on id alone.
    pub fn targets(&self, target_id_field: &str, entity_type: &str, entity_id: &str) -> bool {
        let type_matches = self
            .entity_type
            .as_deref()
            .is_none_or(|own| own == entity_type);
        type_matches && self.target_id(target_id_field) == Some(entity_id)
    }
}

#[derive(Debug)]
pub struct PendingQueue {
    records: Vec<PendingMutationRecord>,
    target_id_field: String,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new("id")
    }
}

impl PendingQueue {
    pub fn new(target_id_field: impl Into<String>) -> Self {
        Self {
            records: Vec::new(),
            target_id_field: target_id_field.into(),
        }
    }

    /// Add a record. A record with the same id replaces the existing one in place.
    pub fn add(&mut self, record: PendingMutationRecord) {
        match self
            .records
            .iter_mut()
            .find(|r| r.client_mutation_id == record.client_mutation_id)
        {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn remove(&mut self, client_mutation_id: &str) -> Option<PendingMutationRecord> {
        let index = self
            .records
            .iter()
            .position(|r| r.client_mutation_id == client_mutation_id)?;
        Some(self.records.remove(index))
    }

    pub fn get(&self, client_mutation_id: &str) -> Option<&PendingMutationRecord> {
        self.records
            .iter()
            .find(|r| r.client_mutation_id == client_mutation_id)
    }

    pub fn all(&self) -> Vec<PendingMutationRecord> {
        self.records.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMutationRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_pending_for_entity(&self, entity_type: &str, entity_id: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.targets(&self.target_id_field, entity_type, entity_id))
    }
}
