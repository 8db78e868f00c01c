use optimist::plan::required_str;
use optimist::{EntityPatch, OptimisticPatch, PatchError, Patches};
use serde_json::{Map, Value, json};

use super::{apply_property_inputs, copy_if_present, property_inputs, update_data};
use crate::entities::{LOCATION_NODE, USER, entity_ref, task_key};

fn set_task_fields(variables: &Value, fields: Map<String, Value>) -> Result<Patches, PatchError> {
    let id = required_str(variables, "id")?;
    let patch: Box<dyn OptimisticPatch> = Box::new(EntityPatch::set_fields(task_key(id), fields));
    Ok(vec![patch])
}

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(field, value)| (field.to_string(), value))
        .collect()
}

pub fn complete_task(variables: &Value) -> Result<Patches, PatchError> {
    set_task_fields(variables, fields([("done", json!(true))]))
}

pub fn reopen_task(variables: &Value) -> Result<Patches, PatchError> {
    set_task_fields(variables, fields([("done", json!(false))]))
}

pub fn assign_task(variables: &Value) -> Result<Patches, PatchError> {
    let user_id = required_str(variables, "userId")?;
    set_task_fields(
        variables,
        fields([
            ("assignee", entity_ref(USER, user_id)),
            ("assigneeTeam", Value::Null),
        ]),
    )
}

pub fn assign_task_to_team(variables: &Value) -> Result<Patches, PatchError> {
    let team_id = required_str(variables, "teamId")?;
    set_task_fields(
        variables,
        fields([
            ("assignee", Value::Null),
            ("assigneeTeam", entity_ref(LOCATION_NODE, team_id)),
        ]),
    )
}

pub fn unassign_task(variables: &Value) -> Result<Patches, PatchError> {
    set_task_fields(variables, fields([("assignee", Value::Null)]))
}

/// Applies the fields named in `data`: `title`, `description`, `done`, `dueDate`, `priority`,
/// `estimatedTime` and `properties`.
pub fn update_task(variables: &Value) -> Result<Patches, PatchError> {
    let id = required_str(variables, "id")?.to_string();
    let data = update_data(variables)?;
    let properties = property_inputs(&data)?;

    let key = task_key(&id);
    let patch: Box<dyn OptimisticPatch> = Box::new(EntityPatch::new(key, move |task| {
        copy_if_present(task, &data, "title", Some(json!("")));
        copy_if_present(task, &data, "description", None);
        copy_if_present(task, &data, "done", Some(json!(false)));
        copy_if_present(task, &data, "dueDate", None);
        copy_if_present(task, &data, "priority", None);
        copy_if_present(task, &data, "estimatedTime", None);
        if let Some(inputs) = &properties {
            apply_property_inputs(&id, task, inputs);
        }
    }));
    Ok(vec![patch])
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimist::Cache;

    fn cache_with_task() -> Cache {
        let mut cache = Cache::new();
        cache.write(
            task_key("t1"),
            json!({
                "id": "t1",
                "title": "Check vitals",
                "description": "Every four hours",
                "done": false,
                "assignee": { "__ref": "User:u1" },
                "assigneeTeam": null,
                "properties": [],
            }),
        );
        cache
    }

    fn apply(plan: fn(&Value) -> Result<Patches, PatchError>, cache: &mut Cache, variables: Value) -> Patches {
        let mut patches = plan(&variables).unwrap();
        for patch in &mut patches {
            patch.apply(cache, &variables).unwrap();
        }
        patches
    }

    #[test]
    fn complete_and_reopen() {
        let mut cache = cache_with_task();
        apply(complete_task, &mut cache, json!({ "id": "t1" }));
        assert_eq!(cache.read(&task_key("t1")).unwrap()["done"], json!(true));
        apply(reopen_task, &mut cache, json!({ "id": "t1" }));
        assert_eq!(cache.read(&task_key("t1")).unwrap()["done"], json!(false));
    }

    #[test]
    fn team_assignment_clears_the_user() {
        let mut cache = cache_with_task();
        apply(
            assign_task_to_team,
            &mut cache,
            json!({ "id": "t1", "teamId": "ward-3" }),
        );
        let task = cache.read(&task_key("t1")).unwrap();
        assert_eq!(task["assignee"], Value::Null);
        assert_eq!(task["assigneeTeam"], json!({ "__ref": "LocationNode:ward-3" }));

        apply(assign_task, &mut cache, json!({ "id": "t1", "userId": "u2" }));
        let task = cache.read(&task_key("t1")).unwrap();
        assert_eq!(task["assignee"], json!({ "__ref": "User:u2" }));
        assert_eq!(task["assigneeTeam"], Value::Null);
    }

    #[test]
    fn update_only_touches_named_fields() {
        let mut cache = cache_with_task();
        let before = cache.read(&task_key("t1")).cloned();
        let variables = json!({
            "id": "t1",
            "data": {
                "title": null,
                "done": true,
                "properties": [{ "definitionId": "severity", "textValue": "high" }],
            },
        });
        let mut patches = apply(update_task, &mut cache, variables.clone());

        let task = cache.read(&task_key("t1")).unwrap();
        assert_eq!(task["title"], json!(""));
        assert_eq!(task["description"], json!("Every four hours"));
        assert_eq!(task["done"], json!(true));
        assert_eq!(task["properties"][0]["id"], json!("attachment-t1-severity"));

        for patch in patches.iter_mut().rev() {
            patch.rollback(&mut cache, &variables).unwrap();
        }
        assert_eq!(cache.read(&task_key("t1")).cloned(), before);
    }

    #[test]
    fn bad_variables_are_rejected_up_front() {
        assert!(matches!(
            assign_task(&json!({ "id": "t1" })),
            Err(PatchError::MissingVariable(field)) if field == "userId"
        ));
        assert!(matches!(
            update_task(&json!({ "id": "t1", "data": [] })),
            Err(PatchError::InvalidVariable { .. })
        ));
        assert!(matches!(
            update_task(&json!({ "id": "t1", "data": { "properties": "high" } })),
            Err(PatchError::InvalidVariable { .. })
        ));
    }
}
