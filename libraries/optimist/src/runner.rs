//! # Mutation runner
//! Applies a mutation's optimistic patches, sends it, and either commits or rolls back.
//!
//! For one attempt the order is fixed: the record enters the in-memory queue and the outbox, the
//! entity is marked, patches are applied, and only then is the network call made. On failure the
//! patches are rolled back before the record leaves the queue, so "pending" is never reported for
//! a mutation whose effects are already gone.

use std::rc::Rc;

use futures::future::LocalBoxFuture;
use serde_json::Value;

use crate::cache::{Cache, EntityKey};
use crate::error::{MutationError, PatchError};
use crate::plan::{OptimisticPlan, Patches};
use crate::queue::PendingMutationRecord;
use crate::store::DurableStore;
use crate::transport::{Operation, Transport};

/// How to resolve a write that collided with newer server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictChoice {
    /// Send the same mutation again under a fresh correlation id.
    Retry,
    /// Drop the local attempt and refetch every active query.
    UseServer,
    /// Surface the failure like any other.
    KeepLocal,
}

/// Decides a conflict. An `Err` is reported to the caller as a failed resolution.
pub type ConflictHandler =
    Rc<dyn Fn(&MutationError, &Value) -> LocalBoxFuture<'static, Result<ConflictChoice, String>>>;

type SuccessCallback = Box<dyn FnOnce(&Value, &Value)>;
type ErrorCallback = Box<dyn FnOnce(&MutationError, &Value)>;
type WriteResult = Box<dyn FnOnce(&mut Cache, &Value)>;

#[derive(Default)]
pub struct MutateOptions {
    entity_type: Option<String>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    on_conflict: Option<ConflictHandler>,
    write_result: Option<WriteResult>,
}

impl MutateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entity type the mutation targets; together with the target id it enables echo
    /// suppression for that entity.
    pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Called with the response data and the variables that were sent.
    pub fn on_success(mut self, callback: impl FnOnce(&Value, &Value) + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnOnce(&MutationError, &Value) + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn on_conflict(mut self, handler: ConflictHandler) -> Self {
        self.on_conflict = Some(handler);
        self
    }

    /// Write confirmed response data into the cache before `on_success` runs.
    pub fn write_result(mut self, write: impl FnOnce(&mut Cache, &Value) + 'static) -> Self {
        self.write_result = Some(Box::new(write));
        self
    }

    fn fail(self, error: MutationError, variables: &Value) -> MutationError {
        if let Some(on_error) = self.on_error {
            on_error(&error, variables);
        }
        error
    }
}

impl<T: Transport + 'static, S: DurableStore + 'static> crate::Engine<T, S> {
    /// Run a mutation through its optimistic plan. Resolves with the confirmed response data.
    ///
    /// # Panics
    ///
    /// Settling schedules a snapshot write with [`tokio::task::spawn_local`], so this must be
    /// polled inside a [`tokio::task::LocalSet`].
    pub async fn mutate(
        self: &Rc<Self>,
        operation: Operation,
        variables: Value,
        plan: Rc<dyn OptimisticPlan>,
        plan_key: impl Into<String>,
        options: MutateOptions,
    ) -> Result<Value, MutationError> {
        self.mutate_attempt(operation, variables, plan, plan_key.into(), options)
            .await
    }

    /// Like [`Self::mutate`], resolving the plan from the registry. Panics under the same
    /// conditions.
    pub async fn mutate_registered(
        self: &Rc<Self>,
        operation: Operation,
        variables: Value,
        plan_key: &str,
        options: MutateOptions,
    ) -> Result<Value, MutationError> {
        let plan = self
            .registry
            .borrow()
            .get(plan_key)
            .ok_or_else(|| MutationError::UnknownPlan(plan_key.to_string()))?;
        self.mutate(operation, variables, plan, plan_key, options)
            .await
    }

    async fn mutate_attempt(
        self: &Rc<Self>,
        operation: Operation,
        mut variables: Value,
        plan: Rc<dyn OptimisticPlan>,
        plan_key: String,
        options: MutateOptions,
    ) -> Result<Value, MutationError> {
        if !variables.is_object() {
            return Err(options.fail(MutationError::InvalidVariables, &variables));
        }
        let correlation_field = self.config.correlation_field.as_str();
        let client_mutation_id = ensure_correlation_id(&mut variables, correlation_field);

        let record = PendingMutationRecord {
            client_mutation_id: client_mutation_id.clone(),
            operation: operation.clone(),
            variables: variables.clone(),
            plan_key: plan_key.clone(),
            entity_type: options.entity_type.clone(),
            created_at: self.clock.now(),
        };
        let marker_key = options.entity_type.as_ref().and_then(|entity_type| {
            let id = record.target_id(&self.config.target_id_field)?;
            Some(EntityKey::new(entity_type.clone(), id))
        });

        self.queue.borrow_mut().add(record.clone());
        if let Err(e) = self.store.put_pending(&record).await {
            log::warn!("Failed to persist pending mutation {client_mutation_id}: {e}");
        }

        if let Some(key) = &marker_key {
            self.tracker
                .borrow_mut()
                .mark_mutated(key.clone(), &client_mutation_id, self.clock.now());
        }

        let mut patches = match self.apply_plan(plan.as_ref(), &variables) {
            Ok(patches) => patches,
            Err(e) => {
                self.settle(&client_mutation_id, marker_key.as_ref(), false)
                    .await;
                return Err(options.fail(MutationError::Patch(e), &variables));
            }
        };

        let response = self.transport.mutate(&operation, &variables).await;
        let error = match response {
            Ok(Some(data)) if !data.is_null() => {
                self.settle(&client_mutation_id, marker_key.as_ref(), true)
                    .await;
                let MutateOptions {
                    on_success,
                    write_result,
                    ..
                } = options;
                if let Some(write_result) = write_result {
                    self.update_cache(|cache| write_result(cache, &data));
                }
                if let Some(on_success) = on_success {
                    on_success(&data, &variables);
                }
                self.schedule_persist();
                return Ok(data);
            }
            Ok(_) => MutationError::EmptyResponse,
            Err(e) => MutationError::from_transport(e),
        };

        self.rollback(&mut patches, &variables);
        self.settle(&client_mutation_id, marker_key.as_ref(), false)
            .await;
        self.schedule_persist();

        let is_conflict = error.conflict().is_some();
        let handler = match options.on_conflict.clone() {
            Some(handler) if is_conflict => handler,
            _ => return Err(options.fail(error, &variables)),
        };
        log::info!(
            "Mutation {} ({client_mutation_id}) conflicted: {error}",
            operation.name
        );

        match handler(&error, &variables).await {
            Ok(ConflictChoice::Retry) => {
                log::info!("Retrying {} after conflict", operation.name);
                if let Value::Object(fields) = &mut variables {
                    fields.remove(correlation_field);
                }
                Box::pin(self.mutate_attempt(operation, variables, plan, plan_key, options)).await
            }
            Ok(ConflictChoice::UseServer) => {
                log::info!("Using server state after conflict in {}", operation.name);
                self.refetch_active_queries().await;
                Err(error)
            }
            Ok(ConflictChoice::KeepLocal) => Err(options.fail(error, &variables)),
            Err(reason) => {
                log::warn!("Conflict resolution for {} failed: {reason}", operation.name);
                Err(options.fail(MutationError::ConflictResolution(reason), &variables))
            }
        }
    }

    /// Compute and apply the plan's patches. If any patch fails, the ones already applied are
    /// rolled back before the error is returned.
    fn apply_plan(
        &self,
        plan: &dyn OptimisticPlan,
        variables: &Value,
    ) -> Result<Patches, PatchError> {
        let mut patches = plan.patches(variables)?;
        self.update_cache(|cache| {
            for applied in 0..patches.len() {
                if let Err(e) = patches[applied].apply(cache, variables) {
                    rollback_patches(cache, &mut patches[..applied], variables);
                    return Err(e);
                }
            }
            Ok(())
        })?;
        Ok(patches)
    }

    fn rollback(&self, patches: &mut Patches, variables: &Value) {
        self.update_cache(|cache| rollback_patches(cache, patches, variables));
    }

    /// Take the mutation out of the queue and the outbox, then commit or clear its marker.
    async fn settle(&self, client_mutation_id: &str, marker: Option<&EntityKey>, committed: bool) {
        self.queue.borrow_mut().remove(client_mutation_id);
        if let Some(key) = marker {
            let mut tracker = self.tracker.borrow_mut();
            if committed {
                tracker.mark_committed(key.clone(), client_mutation_id, self.clock.now());
            } else {
                tracker.clear_mutated(key);
            }
        }
        if let Err(e) = self.store.delete_pending(client_mutation_id).await {
            log::warn!("Failed to remove pending mutation {client_mutation_id} from storage: {e}");
        }
    }
}

/// Reuse the caller's correlation id, or generate one and write it into the variables.
fn ensure_correlation_id(variables: &mut Value, correlation_field: &str) -> String {
    if let Some(id) = variables.get(correlation_field).and_then(Value::as_str) {
        return id.to_string();
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Value::Object(fields) = variables {
        fields.insert(correlation_field.to_string(), Value::String(id.clone()));
    }
    id
}

/// Roll back in reverse order. A failing rollback is logged and the rest still run.
pub(crate) fn rollback_patches(
    cache: &mut Cache,
    patches: &mut [Box<dyn crate::plan::OptimisticPatch>],
    variables: &Value,
) {
    for patch in patches.iter_mut().rev() {
        if let Err(e) = patch.rollback(cache, variables) {
            log::warn!("Optimistic rollback failed: {e}");
        }
    }
}
