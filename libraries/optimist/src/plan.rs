//! # Optimistic plans
//! A plan turns a mutation's variables into the reversible cache patches that show its effect
//! before the server confirms it. Plans are registered once per mutation kind under a stable key:
//! a persisted pending mutation only stores that key, and after a reload the key is looked up
//! here to get live patch logic back.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::cache::{Cache, EntityKey, QueryKey};
use crate::error::PatchError;

/// One reversible cache edit, scoped to a single mutation attempt.
///
/// `rollback` must exactly undo `apply` when nothing else touched the cache in between.
pub trait OptimisticPatch {
    fn apply(&mut self, cache: &mut Cache, variables: &Value) -> Result<(), PatchError>;
    fn rollback(&mut self, cache: &mut Cache, variables: &Value) -> Result<(), PatchError>;
}

pub type Patches = Vec<Box<dyn OptimisticPatch>>;

/// Pure function from variables to patches.
pub trait OptimisticPlan {
    fn patches(&self, variables: &Value) -> Result<Patches, PatchError>;
}

impl<F> OptimisticPlan for F
where
    F: Fn(&Value) -> Result<Patches, PatchError>,
{
    fn patches(&self, variables: &Value) -> Result<Patches, PatchError> {
        self(variables)
    }
}

/// Edits one cached entity, restoring its exact previous value on rollback.
/// Does nothing when the entity is not cached.
pub struct EntityPatch {
    key: EntityKey,
    edit: Box<dyn Fn(&mut Map<String, Value>)>,
    previous: Option<Value>,
    captured: bool,
}

impl EntityPatch {
    pub fn new(key: EntityKey, edit: impl Fn(&mut Map<String, Value>) + 'static) -> Self {
        Self {
            key,
            edit: Box::new(edit),
            previous: None,
            captured: false,
        }
    }

    /// Overwrite the given fields, leaving the rest of the entity alone.
    pub fn set_fields(key: EntityKey, fields: Map<String, Value>) -> Self {
        Self::new(key, move |entity| {
            for (field, value) in &fields {
                entity.insert(field.clone(), value.clone());
            }
        })
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }
}

impl OptimisticPatch for EntityPatch {
    fn apply(&mut self, cache: &mut Cache, _variables: &Value) -> Result<(), PatchError> {
        if !self.captured {
            self.previous = cache.read(&self.key).cloned();
            self.captured = true;
        }
        cache.modify(&self.key, |fields| (self.edit)(fields))?;
        Ok(())
    }

    fn rollback(&mut self, cache: &mut Cache, _variables: &Value) -> Result<(), PatchError> {
        if let Some(previous) = self.previous.take() {
            cache.write(self.key.clone(), previous);
        }
        self.captured = false;
        Ok(())
    }
}

impl fmt::Debug for EntityPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityPatch")
            .field("key", &self.key)
            .field("captured", &self.captured)
            .finish()
    }
}

/// Edits one cached query result (e.g. a list), restoring it on rollback.
pub struct QueryPatch {
    key: QueryKey,
    edit: Box<dyn Fn(&mut Value)>,
    previous: Option<Value>,
    captured: bool,
}

impl QueryPatch {
    pub fn new(key: QueryKey, edit: impl Fn(&mut Value) + 'static) -> Self {
        Self {
            key,
            edit: Box::new(edit),
            previous: None,
            captured: false,
        }
    }
}

impl OptimisticPatch for QueryPatch {
    fn apply(&mut self, cache: &mut Cache, _variables: &Value) -> Result<(), PatchError> {
        let current = cache.read_query(&self.key).cloned();
        if !self.captured {
            self.previous = current.clone();
            self.captured = true;
        }
        if let Some(mut value) = current {
            (self.edit)(&mut value);
            cache.write_query(self.key.clone(), value);
        }
        Ok(())
    }

    fn rollback(&mut self, cache: &mut Cache, _variables: &Value) -> Result<(), PatchError> {
        if let Some(previous) = self.previous.take() {
            cache.write_query(self.key.clone(), previous);
        }
        self.captured = false;
        Ok(())
    }
}

/// Read a required string variable.
pub fn required_str<'a>(variables: &'a Value, field: &str) -> Result<&'a str, PatchError> {
    match variables.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(PatchError::InvalidVariable {
            field: field.to_string(),
            reason: format!("expected a string, got {other}"),
        }),
        None => Err(PatchError::MissingVariable(field.to_string())),
    }
}

/// Mutation kinds by plan key.
#[derive(Clone, Default)]
pub struct PlanRegistry {
    plans: HashMap<String, Rc<dyn OptimisticPlan>>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, plan: impl OptimisticPlan + 'static) {
        self.register_rc(key, Rc::new(plan));
    }

    pub fn register_rc(&mut self, key: impl Into<String>, plan: Rc<dyn OptimisticPlan>) {
        let key = key.into();
        if self.plans.insert(key.clone(), plan).is_some() {
            log::warn!("Optimistic plan `{key}` was registered twice; keeping the latest");
        }
    }

    pub fn get(&self, key: &str) -> Option<Rc<dyn OptimisticPlan>> {
        self.plans.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.plans.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.plans.keys().map(String::as_str)
    }
}

impl fmt::Debug for PlanRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("PlanRegistry").field("keys", &keys).finish()
    }
}
