//! # Cache
//! The client-held, normalized view of server state plus whatever optimistic patches are applied.
//! Entities live under an [`EntityKey`] (`"Type:id"`), query results under a [`QueryKey`].
//!
//! Backed by `im::OrdMap`, so taking a [`CacheSnapshot`] is a cheap structural clone. Every write
//! is recorded in a change log that the engine drains after it releases its borrow, which is when
//! listeners get notified.

use std::fmt;

use im::OrdMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::PatchError;
use crate::transport::Operation;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub entity_type: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Parse the `"Type:id"` form. Ids may contain `:`; the type may not.
    pub fn parse(s: &str) -> Option<Self> {
        let (entity_type, id) = s.split_once(':')?;
        if entity_type.is_empty() {
            return None;
        }
        Some(Self::new(entity_type, id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

impl Serialize for EntityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EntityKey::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid entity key `{s}`")))
    }
}

/// Identity of a query result: operation name plus its canonical (key-sorted) variables.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryKey {
    pub operation: String,
    pub variables: String,
}

impl QueryKey {
    pub fn new(operation: &Operation, variables: &Value) -> Self {
        Self {
            operation: operation.name.clone(),
            variables: variables.to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (operation, rest) = s.split_once('(')?;
        let variables = rest.strip_suffix(')')?;
        Some(Self {
            operation: operation.to_string(),
            variables: variables.to_string(),
        })
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.operation, self.variables)
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        QueryKey::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid query key `{s}`")))
    }
}

/// The whole cache in serializable form.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    #[serde(default)]
    pub entities: OrdMap<EntityKey, Value>,
    #[serde(default)]
    pub queries: OrdMap<QueryKey, Value>,
}

impl CacheSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.queries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.queries.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheChange {
    Entity(EntityKey),
    Query(QueryKey),
    Restored,
}

#[derive(Debug, Default)]
pub struct Cache {
    data: CacheSnapshot,
    changes: Vec<CacheChange>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, key: &EntityKey) -> Option<&Value> {
        self.data.entities.get(key)
    }

    pub fn write(&mut self, key: EntityKey, value: Value) {
        self.changes.push(CacheChange::Entity(key.clone()));
        self.data.entities.insert(key, value);
    }

    /// Edit an entity's fields in place. Returns `Ok(false)` when the entity is not cached.
    pub fn modify(
        &mut self,
        key: &EntityKey,
        edit: impl FnOnce(&mut Map<String, Value>),
    ) -> Result<bool, PatchError> {
        let Some(entity) = self.data.entities.get_mut(key) else {
            return Ok(false);
        };
        let Value::Object(fields) = entity else {
            return Err(PatchError::NotAnObject(key.clone()));
        };
        edit(fields);
        self.changes.push(CacheChange::Entity(key.clone()));
        Ok(true)
    }

    pub fn evict(&mut self, key: &EntityKey) -> Option<Value> {
        let removed = self.data.entities.remove(key);
        if removed.is_some() {
            self.changes.push(CacheChange::Entity(key.clone()));
        }
        removed
    }

    pub fn read_query(&self, key: &QueryKey) -> Option<&Value> {
        self.data.queries.get(key)
    }

    pub fn write_query(&mut self, key: QueryKey, value: Value) {
        self.changes.push(CacheChange::Query(key.clone()));
        self.data.queries.insert(key, value);
    }

    pub fn evict_query(&mut self, key: &QueryKey) -> Option<Value> {
        let removed = self.data.queries.remove(key);
        if removed.is_some() {
            self.changes.push(CacheChange::Query(key.clone()));
        }
        removed
    }

    pub fn entities(&self) -> impl Iterator<Item = (&EntityKey, &Value)> {
        self.data.entities.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn extract(&self) -> CacheSnapshot {
        self.data.clone()
    }

    pub fn restore(&mut self, snapshot: CacheSnapshot) {
        self.data = snapshot;
        self.changes.push(CacheChange::Restored);
    }

    pub(crate) fn take_changes(&mut self) -> Vec<CacheChange> {
        std::mem::take(&mut self.changes)
    }
}
