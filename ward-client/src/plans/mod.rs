//! Optimistic plans for every mutation the client makes, by plan key.
//!
//! The keys end up in persisted outbox records, so renaming one strands any mutation stored
//! under the old name.

use optimist::{PatchError, PlanRegistry};
use serde_json::{Map, Value};

use crate::entities::{PropertyValueInput, merge_properties};

pub mod patients;
pub mod tasks;

pub const COMPLETE_TASK: &str = "CompleteTask";
pub const REOPEN_TASK: &str = "ReopenTask";
pub const ASSIGN_TASK: &str = "AssignTask";
pub const ASSIGN_TASK_TO_TEAM: &str = "AssignTaskToTeam";
pub const UNASSIGN_TASK: &str = "UnassignTask";
pub const UPDATE_TASK: &str = "UpdateTask";
pub const UPDATE_PATIENT: &str = "UpdatePatient";
pub const ADMIT_PATIENT: &str = "AdmitPatient";
pub const DISCHARGE_PATIENT: &str = "DischargePatient";
pub const WAIT_PATIENT: &str = "WaitPatient";
pub const MARK_PATIENT_DEAD: &str = "MarkPatientDead";

pub fn register_plans(registry: &mut PlanRegistry) {
    registry.register(COMPLETE_TASK, tasks::complete_task);
    registry.register(REOPEN_TASK, tasks::reopen_task);
    registry.register(ASSIGN_TASK, tasks::assign_task);
    registry.register(ASSIGN_TASK_TO_TEAM, tasks::assign_task_to_team);
    registry.register(UNASSIGN_TASK, tasks::unassign_task);
    registry.register(UPDATE_TASK, tasks::update_task);
    registry.register(UPDATE_PATIENT, patients::update_patient);
    registry.register(ADMIT_PATIENT, patients::admit_patient);
    registry.register(DISCHARGE_PATIENT, patients::discharge_patient);
    registry.register(WAIT_PATIENT, patients::wait_patient);
    registry.register(MARK_PATIENT_DEAD, patients::mark_patient_dead);
}

/// The `data` object of an update mutation.
fn update_data(variables: &Value) -> Result<Map<String, Value>, PatchError> {
    match variables.get("data") {
        Some(Value::Object(data)) => Ok(data.clone()),
        Some(other) => Err(PatchError::InvalidVariable {
            field: "data".to_string(),
            reason: format!("expected an object, got {other}"),
        }),
        None => Err(PatchError::MissingVariable("data".to_string())),
    }
}

fn property_inputs(
    data: &Map<String, Value>,
) -> Result<Option<Vec<PropertyValueInput>>, PatchError> {
    match data.get("properties") {
        None | Some(Value::Null) => Ok(None),
        Some(properties) => serde_json::from_value(properties.clone())
            .map(Some)
            .map_err(|e| PatchError::InvalidVariable {
                field: "data.properties".to_string(),
                reason: e.to_string(),
            }),
    }
}

fn apply_property_inputs(
    entity_id: &str,
    entity: &mut Map<String, Value>,
    inputs: &[PropertyValueInput],
) {
    let existing = match entity.get("properties") {
        Some(Value::Array(existing)) => existing.as_slice(),
        _ => &[],
    };
    let merged = merge_properties(entity_id, existing, inputs);
    entity.insert("properties".to_string(), Value::Array(merged));
}

/// Copy `field` from `data` when the update names it, substituting `null_as` for an explicit null.
fn copy_if_present(
    entity: &mut Map<String, Value>,
    data: &Map<String, Value>,
    field: &str,
    null_as: Option<Value>,
) {
    let Some(value) = data.get(field) else {
        return;
    };
    let value = match (value, null_as) {
        (Value::Null, Some(default)) => default,
        (value, _) => value.clone(),
    };
    entity.insert(field.to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_plan_is_registered() {
        let mut registry = PlanRegistry::new();
        register_plans(&mut registry);
        for key in [
            COMPLETE_TASK,
            REOPEN_TASK,
            ASSIGN_TASK,
            ASSIGN_TASK_TO_TEAM,
            UNASSIGN_TASK,
            UPDATE_TASK,
            UPDATE_PATIENT,
            ADMIT_PATIENT,
            DISCHARGE_PATIENT,
            WAIT_PATIENT,
            MARK_PATIENT_DEAD,
        ] {
            assert!(registry.contains(key), "{key} is not registered");
        }
        assert_eq!(registry.keys().count(), 11);
    }
}
