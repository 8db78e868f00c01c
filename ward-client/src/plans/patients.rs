use optimist::plan::required_str;
use optimist::{EntityPatch, OptimisticPatch, PatchError, Patches};
use serde_json::{Map, Value, json};

use super::{apply_property_inputs, copy_if_present, property_inputs, update_data};
use crate::entities::{PatientState, patient_key};

fn set_state(variables: &Value, state: PatientState) -> Result<Patches, PatchError> {
    let id = required_str(variables, "id")?;
    let mut fields = Map::new();
    fields.insert("state".to_string(), json!(state.as_str()));
    let patch: Box<dyn OptimisticPatch> =
        Box::new(EntityPatch::set_fields(patient_key(id), fields));
    Ok(vec![patch])
}

pub fn admit_patient(variables: &Value) -> Result<Patches, PatchError> {
    set_state(variables, PatientState::Admitted)
}

pub fn discharge_patient(variables: &Value) -> Result<Patches, PatchError> {
    set_state(variables, PatientState::Discharged)
}

pub fn wait_patient(variables: &Value) -> Result<Patches, PatchError> {
    set_state(variables, PatientState::Wait)
}

pub fn mark_patient_dead(variables: &Value) -> Result<Patches, PatchError> {
    set_state(variables, PatientState::Dead)
}

/// Applies `firstname`, `lastname`, `birthdate`, `sex` and `properties` from `data`.
pub fn update_patient(variables: &Value) -> Result<Patches, PatchError> {
    let id = required_str(variables, "id")?.to_string();
    let data = update_data(variables)?;
    let properties = property_inputs(&data)?;

    let key = patient_key(&id);
    let patch: Box<dyn OptimisticPatch> = Box::new(EntityPatch::new(key, move |patient| {
        copy_if_present(patient, &data, "firstname", Some(json!("")));
        copy_if_present(patient, &data, "lastname", Some(json!("")));
        copy_if_present(patient, &data, "birthdate", None);
        // sex is never left null, even when the update does not name it
        let sex = data
            .get("sex")
            .or_else(|| patient.get("sex"))
            .filter(|sex| !sex.is_null())
            .cloned()
            .unwrap_or_else(|| json!(""));
        patient.insert("sex".to_string(), sex);
        if let Some(inputs) = &properties {
            apply_property_inputs(&id, patient, inputs);
        }
    }));
    Ok(vec![patch])
}
