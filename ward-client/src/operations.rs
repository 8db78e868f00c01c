//! The server operations the client sends. Documents are passed to the transport untouched.

use optimist::Operation;

const TASK_FIELDS: &str = "id title description done dueDate priority estimatedTime updateDate \
    checksum assignee { id name } assigneeTeam { id title } patient { id name } \
    properties { id definition { id name fieldType } textValue numberValue booleanValue \
    dateValue dateTimeValue selectValue multiSelectValues userValue }";

const PATIENT_FIELDS: &str = "id firstname lastname birthdate sex state updateDate checksum \
    properties { id definition { id name fieldType } textValue numberValue booleanValue \
    dateValue dateTimeValue selectValue multiSelectValues userValue }";

fn task_mutation(name: &str, field: &str, params: &str, args: &str) -> Operation {
    Operation::new(
        name,
        format!("mutation {name}({params}) {{ {field}({args}) {{ {TASK_FIELDS} }} }}"),
    )
}

fn patient_mutation(name: &str, field: &str, params: &str, args: &str) -> Operation {
    Operation::new(
        name,
        format!("mutation {name}({params}) {{ {field}({args}) {{ {PATIENT_FIELDS} }} }}"),
    )
}

pub fn get_task() -> Operation {
    Operation::new(
        "GetTask",
        format!("query GetTask($id: ID!) {{ task(id: $id) {{ {TASK_FIELDS} }} }}"),
    )
}

pub fn get_patient() -> Operation {
    Operation::new(
        "GetPatient",
        format!("query GetPatient($id: ID!) {{ patient(id: $id) {{ {PATIENT_FIELDS} }} }}"),
    )
}

pub fn get_global_data() -> Operation {
    Operation::new(
        "GetGlobalData",
        "query GetGlobalData { me { id name tasks { id done } } wards: locationNodes(kind: WARD) { id title } }",
    )
}

pub fn complete_task() -> Operation {
    task_mutation("CompleteTask", "completeTask", "$id: ID!", "id: $id")
}

pub fn reopen_task() -> Operation {
    task_mutation("ReopenTask", "reopenTask", "$id: ID!", "id: $id")
}

pub fn assign_task() -> Operation {
    task_mutation(
        "AssignTask",
        "assignTask",
        "$id: ID!, $userId: ID!",
        "id: $id, userId: $userId",
    )
}

pub fn assign_task_to_team() -> Operation {
    task_mutation(
        "AssignTaskToTeam",
        "assignTaskToTeam",
        "$id: ID!, $teamId: ID!",
        "id: $id, teamId: $teamId",
    )
}

pub fn unassign_task() -> Operation {
    task_mutation("UnassignTask", "unassignTask", "$id: ID!", "id: $id")
}

pub fn update_task() -> Operation {
    task_mutation(
        "UpdateTask",
        "updateTask",
        "$id: ID!, $data: UpdateTaskInput!",
        "id: $id, data: $data",
    )
}

pub fn update_patient() -> Operation {
    patient_mutation(
        "UpdatePatient",
        "updatePatient",
        "$id: ID!, $data: UpdatePatientInput!",
        "id: $id, data: $data",
    )
}

pub fn admit_patient() -> Operation {
    patient_mutation("AdmitPatient", "admitPatient", "$id: ID!", "id: $id")
}

pub fn discharge_patient() -> Operation {
    patient_mutation("DischargePatient", "dischargePatient", "$id: ID!", "id: $id")
}

pub fn wait_patient() -> Operation {
    patient_mutation("WaitPatient", "waitPatient", "$id: ID!", "id: $id")
}

pub fn mark_patient_dead() -> Operation {
    patient_mutation("MarkPatientDead", "markPatientDead", "$id: ID!", "id: $id")
}

pub fn task_updated() -> Operation {
    Operation::new(
        "TaskUpdated",
        "subscription TaskUpdated($taskId: ID, $rootLocationIds: [ID!]) { taskUpdated(taskId: $taskId, rootLocationIds: $rootLocationIds) }",
    )
}

pub fn patient_updated() -> Operation {
    Operation::new(
        "PatientUpdated",
        "subscription PatientUpdated($patientId: ID, $rootLocationIds: [ID!]) { patientUpdated(patientId: $patientId, rootLocationIds: $rootLocationIds) }",
    )
}

pub fn patient_created() -> Operation {
    Operation::new(
        "PatientCreated",
        "subscription PatientCreated($rootLocationIds: [ID!]) { patientCreated(rootLocationIds: $rootLocationIds) }",
    )
}
