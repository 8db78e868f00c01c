//! Client-side state for the ward-management app: the optimistic plans for tasks and patients,
//! the conflict prompt, and the live-update subscriptions, wired onto an [`optimist::Engine`].
//!
//! Startup order matters. The cached snapshot is restored first, then every mutation still in
//! the outbox has its patches re-applied on top of it, and only then are the subscriptions
//! opened, so a notification never races a replay.

pub mod conflict;
pub mod entities;
pub mod operations;
pub mod payload;
pub mod plans;

use std::cell::RefCell;
use std::rc::Rc;

use optimist::{
    DurableStore, Engine, EngineConfig, EntityQuery, MergeConfig, MutateOptions, MutationError,
    Operation, PlanRegistry, SubscriptionHandle, Transport,
};
use serde_json::{Value, json};

pub use conflict::{ConflictPrompt, ConflictRequest, DialogChoice};
pub use entities::{PatientState, PropertyValueInput};
pub use payload::Topic;

use crate::entities::{PATIENT, TASK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupReport {
    /// Whether a cache snapshot was restored.
    pub restored: bool,
    /// Pending mutations re-applied from the outbox.
    pub replayed: usize,
}

pub struct WardClient<T, S> {
    engine: Rc<Engine<T, S>>,
    conflicts: Rc<ConflictPrompt>,
    subscriptions: RefCell<Vec<SubscriptionHandle>>,
}

impl<T: Transport + 'static, S: DurableStore + 'static> WardClient<T, S> {
    pub fn new(transport: T, store: S, config: EngineConfig) -> Self {
        Self::with_engine(Engine::new(transport, store, config))
    }

    /// Wire an engine built by the caller (e.g. with a custom clock).
    pub fn with_engine(engine: Engine<T, S>) -> Self {
        let mut registry = PlanRegistry::new();
        plans::register_plans(&mut registry);
        let engine = engine.with_registry(registry);

        engine.register_entity_query(TASK, EntityQuery::new(operations::get_task(), "task"));
        engine.register_entity_query(
            PATIENT,
            EntityQuery::new(operations::get_patient(), "patient"),
        );
        engine.set_merge_config(MergeConfig {
            refetch_after_merge: vec![operations::get_global_data().name],
        });

        Self {
            engine: Rc::new(engine),
            conflicts: ConflictPrompt::new(),
            subscriptions: RefCell::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Rc<Engine<T, S>> {
        &self.engine
    }

    pub fn conflicts(&self) -> &Rc<ConflictPrompt> {
        &self.conflicts
    }

    /// Restore the cache, replay the outbox, then open the subscriptions. Like every mutation
    /// helper here, it must run inside a tokio `LocalSet`.
    pub async fn start(&self) -> StartupReport {
        let restored = self.engine.rehydrate().await;
        let replayed = self.engine.replay_pending().await;

        let handles: Vec<SubscriptionHandle> = Topic::ALL
            .into_iter()
            .map(|topic| self.engine.spawn_subscription(&topic.operation(), &json!({})))
            .collect();
        let previous = self.subscriptions.replace(handles);
        if !previous.is_empty() {
            log::warn!("start() called twice; restarting subscriptions");
        }
        drop(previous);

        log::info!("Ward client started (restored: {restored}, replayed: {replayed})");
        StartupReport { restored, replayed }
    }

    pub fn subscription_names(&self) -> Vec<String> {
        self.subscriptions
            .borrow()
            .iter()
            .filter(|handle| !handle.is_finished())
            .map(|handle| handle.name().to_string())
            .collect()
    }

    /// Close the subscriptions and write the cache snapshot.
    pub async fn shutdown(&self) {
        self.subscriptions.borrow_mut().clear();
        self.engine.persist_now().await;
    }

    async fn run(
        &self,
        operation: Operation,
        variables: Value,
        plan_key: &str,
        entity_type: &str,
    ) -> Result<Value, MutationError> {
        let options = MutateOptions::new()
            .entity_type(entity_type)
            .on_conflict(self.conflicts.handler())
            .on_error(|error, variables| {
                log::warn!("Mutation with variables {variables} failed: {error}");
            });
        self.engine
            .mutate_registered(operation, variables, plan_key, options)
            .await
    }

    pub async fn complete_task(&self, task_id: &str) -> Result<Value, MutationError> {
        self.run(
            operations::complete_task(),
            json!({ "id": task_id }),
            plans::COMPLETE_TASK,
            TASK,
        )
        .await
    }

    pub async fn reopen_task(&self, task_id: &str) -> Result<Value, MutationError> {
        self.run(
            operations::reopen_task(),
            json!({ "id": task_id }),
            plans::REOPEN_TASK,
            TASK,
        )
        .await
    }

    pub async fn assign_task(&self, task_id: &str, user_id: &str) -> Result<Value, MutationError> {
        self.run(
            operations::assign_task(),
            json!({ "id": task_id, "userId": user_id }),
            plans::ASSIGN_TASK,
            TASK,
        )
        .await
    }

    pub async fn assign_task_to_team(
        &self,
        task_id: &str,
        team_id: &str,
    ) -> Result<Value, MutationError> {
        self.run(
            operations::assign_task_to_team(),
            json!({ "id": task_id, "teamId": team_id }),
            plans::ASSIGN_TASK_TO_TEAM,
            TASK,
        )
        .await
    }

    pub async fn unassign_task(&self, task_id: &str) -> Result<Value, MutationError> {
        self.run(
            operations::unassign_task(),
            json!({ "id": task_id }),
            plans::UNASSIGN_TASK,
            TASK,
        )
        .await
    }

    /// `data` is an `UpdateTaskInput`; only the fields it names change.
    pub async fn update_task(&self, task_id: &str, data: Value) -> Result<Value, MutationError> {
        self.run(
            operations::update_task(),
            json!({ "id": task_id, "data": data }),
            plans::UPDATE_TASK,
            TASK,
        )
        .await
    }

    /// `data` is an `UpdatePatientInput`; only the fields it names change.
    pub async fn update_patient(
        &self,
        patient_id: &str,
        data: Value,
    ) -> Result<Value, MutationError> {
        self.run(
            operations::update_patient(),
            json!({ "id": patient_id, "data": data }),
            plans::UPDATE_PATIENT,
            PATIENT,
        )
        .await
    }

    pub async fn set_patient_state(
        &self,
        patient_id: &str,
        state: PatientState,
    ) -> Result<Value, MutationError> {
        let (operation, plan_key) = match state {
            PatientState::Admitted => (operations::admit_patient(), plans::ADMIT_PATIENT),
            PatientState::Discharged => (operations::discharge_patient(), plans::DISCHARGE_PATIENT),
            PatientState::Wait => (operations::wait_patient(), plans::WAIT_PATIENT),
            PatientState::Dead => (operations::mark_patient_dead(), plans::MARK_PATIENT_DEAD),
        };
        self.run(operation, json!({ "id": patient_id }), plan_key, PATIENT)
            .await
    }
}
