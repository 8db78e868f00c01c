//! Entity types and the JSON shapes the plans write into the cache.

use optimist::EntityKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const TASK: &str = "Task";
pub const PATIENT: &str = "Patient";
pub const USER: &str = "User";
pub const LOCATION_NODE: &str = "LocationNode";
pub const PROPERTY_DEFINITION: &str = "PropertyDefinition";
pub const PROPERTY_VALUE: &str = "PropertyValue";

pub fn task_key(id: &str) -> EntityKey {
    EntityKey::new(TASK, id)
}

pub fn patient_key(id: &str) -> EntityKey {
    EntityKey::new(PATIENT, id)
}

/// A normalized reference to another cached entity.
pub fn entity_ref(entity_type: &str, id: &str) -> Value {
    json!({ "__ref": EntityKey::new(entity_type, id).to_string() })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatientState {
    Admitted,
    Discharged,
    Wait,
    Dead,
}

impl PatientState {
    pub fn as_str(self) -> &'static str {
        match self {
            PatientState::Admitted => "ADMITTED",
            PatientState::Discharged => "DISCHARGED",
            PatientState::Wait => "WAIT",
            PatientState::Dead => "DEAD",
        }
    }
}

/// The value fields a property input may carry. A field that is absent or null leaves the
/// stored value alone.
pub const PROPERTY_VALUE_FIELDS: [&str; 8] = [
    "textValue",
    "numberValue",
    "booleanValue",
    "dateValue",
    "dateTimeValue",
    "selectValue",
    "multiSelectValues",
    "userValue",
];

/// One entry of an update's `properties` list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyValueInput {
    pub definition_id: String,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl PropertyValueInput {
    pub fn new(definition_id: impl Into<String>) -> Self {
        Self {
            definition_id: definition_id.into(),
            values: Map::new(),
        }
    }

    pub fn with(mut self, field: &str, value: Value) -> Self {
        self.values.insert(field.to_string(), value);
        self
    }

    fn value(&self, field: &str) -> Option<&Value> {
        self.values.get(field).filter(|v| !v.is_null())
    }
}

fn definition_id(property: &Value) -> Option<&str> {
    let definition = property.get("definition")?;
    if let Some(id) = definition.get("id").and_then(Value::as_str) {
        return Some(id);
    }
    let reference = definition.get("__ref").and_then(Value::as_str)?;
    reference.split_once(':').map(|(_, id)| id)
}

/// Merge property inputs over the entity's current property values.
///
/// An input for a definition the entity already has overrides only the value fields it provides.
/// An input for a new definition creates a value with id `attachment-<entity>-<definition>`.
/// Values for definitions not named in `inputs` are dropped, as the server does.
pub fn merge_properties(entity_id: &str, existing: &[Value], inputs: &[PropertyValueInput]) -> Vec<Value> {
    inputs
        .iter()
        .map(|input| {
            let current = existing
                .iter()
                .find(|p| definition_id(p) == Some(input.definition_id.as_str()));
            match current {
                Some(Value::Object(current)) => {
                    let mut merged = current.clone();
                    for field in PROPERTY_VALUE_FIELDS {
                        let value = input
                            .value(field)
                            .or_else(|| current.get(field))
                            .cloned()
                            .unwrap_or(Value::Null);
                        merged.insert(field.to_string(), value);
                    }
                    Value::Object(merged)
                }
                _ => {
                    let mut created = Map::new();
                    created.insert("__typename".to_string(), json!(PROPERTY_VALUE));
                    created.insert(
                        "id".to_string(),
                        json!(format!("attachment-{entity_id}-{}", input.definition_id)),
                    );
                    created.insert(
                        "definition".to_string(),
                        entity_ref(PROPERTY_DEFINITION, &input.definition_id),
                    );
                    for field in PROPERTY_VALUE_FIELDS {
                        created.insert(
                            field.to_string(),
                            input.value(field).cloned().unwrap_or(Value::Null),
                        );
                    }
                    Value::Object(created)
                }
            }
        })
        .collect()
}
