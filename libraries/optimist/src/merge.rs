//! # Subscription merge handler
//! Turns server push notifications into cache updates.
//!
//! Each notification ends up suppressed (an echo of our own write), deferred (a local mutation for
//! the entity is still pending) or merged. Merging point-fetches the entity from the server and
//! writes it only if its revision is strictly newer than what the cache holds: notifications may
//! arrive out of order, and that comparison is the only thing ordering them.

use std::rc::Rc;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};

use crate::Engine;
use crate::cache::EntityKey;
use crate::config::ConflictStrategy;
use crate::error::TransportError;
use crate::store::DurableStore;
use crate::transport::{Notification, NotificationKind, Operation, Transport};

/// How to point-fetch one entity type: `operation` is called with `{ <target id field>: id }` and
/// the entity is read from `data[root_field]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityQuery {
    pub operation: Operation,
    pub root_field: String,
}

impl EntityQuery {
    pub fn new(operation: Operation, root_field: impl Into<String>) -> Self {
        Self {
            operation,
            root_field: root_field.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeConfig {
    /// Operation names refetched, if active, after every merge that changed the cache.
    pub refetch_after_merge: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// A local mutation for the entity is pending; local state wins for now.
    Deferred,
    /// The notification reports our own write.
    Echo,
    Merged,
    /// The fetched revision was not newer than the cached one.
    Stale,
    /// The server had no such entity.
    NotFound,
    Evicted,
    /// No point-fetch query is registered for the entity type.
    Unconfigured,
    FetchFailed(TransportError),
}

impl<T: Transport, S: DurableStore> Engine<T, S> {
    fn should_defer(&self, key: &EntityKey) -> bool {
        self.config.conflict_strategy == ConflictStrategy::Defer
            && self.has_pending_for_entity(&key.entity_type, &key.id)
    }

    /// Whether a notification can be dropped without fetching anything.
    pub fn should_skip_merge(&self, notification: &Notification) -> Option<MergeOutcome> {
        let key = EntityKey::new(&notification.entity_type, &notification.entity_id);
        if self.should_defer(&key) {
            return Some(MergeOutcome::Deferred);
        }
        if self.is_likely_echo(&key, notification.client_mutation_id.as_deref()) {
            return Some(MergeOutcome::Echo);
        }
        None
    }

    pub async fn merge_notification(&self, notification: &Notification) -> MergeOutcome {
        let key = EntityKey::new(&notification.entity_type, &notification.entity_id);

        if let Some(outcome) = self.should_skip_merge(notification) {
            log::debug!("Skipping {:?} notification for {key}: {outcome:?}", notification.kind);
            return outcome;
        }

        let outcome = match notification.kind {
            NotificationKind::Deleted => {
                self.update_cache(|cache| cache.evict(&key));
                MergeOutcome::Evicted
            }
            NotificationKind::Created | NotificationKind::Updated => {
                if self.already_has_revision(&key, notification.revision.as_ref()) {
                    log::debug!("Cache already holds {key} at or past the notified revision");
                    return MergeOutcome::Stale;
                }
                self.fetch_and_merge(&key).await
            }
        };

        if matches!(outcome, MergeOutcome::Merged | MergeOutcome::Evicted) {
            let names = self.merge_config.borrow().refetch_after_merge.clone();
            self.refetch_active_named(&names).await;
        }
        outcome
    }

    /// True when the notification names a revision the cached entity is not older than.
    fn already_has_revision(&self, key: &EntityKey, revision: Option<&Value>) -> bool {
        let Some(revision) = revision else {
            return false;
        };
        let current = self
            .cache
            .borrow()
            .read(key)
            .and_then(|cached| cached.get(&self.config.revision_field))
            .and_then(parse_revision);
        match (parse_revision(revision), current) {
            (Some(notified), Some(current)) => notified <= current,
            _ => false,
        }
    }

    async fn fetch_and_merge(&self, key: &EntityKey) -> MergeOutcome {
        let Some(query) = self.entity_queries.borrow().get(&key.entity_type).cloned() else {
            log::warn!("No entity query registered for {}, cannot merge {key}", key.entity_type);
            return MergeOutcome::Unconfigured;
        };

        let fetched = {
            let _refreshing = RefreshingGuard::new(self, key.clone());
            let mut variables = Map::new();
            variables.insert(
                self.config.target_id_field.clone(),
                Value::String(key.id.clone()),
            );
            self.transport
                .fetch(&query.operation, &Value::Object(variables))
                .await
        };

        let entity = match fetched {
            Ok(data) => data
                .and_then(|mut data| data.get_mut(&query.root_field).map(Value::take))
                .filter(|entity| !entity.is_null()),
            Err(e) => {
                log::warn!("Point-fetch for {key} failed: {e}");
                return MergeOutcome::FetchFailed(e);
            }
        };
        let Some(entity) = entity else {
            return MergeOutcome::NotFound;
        };

        // A local mutation may have started while we were waiting on the server.
        if self.should_defer(key) {
            log::debug!("Deferring fetched {key}: a local mutation started during the fetch");
            return MergeOutcome::Deferred;
        }

        let revision_field = self.config.revision_field.as_str();
        let written = self.update_cache(|cache| {
            let current = cache.read(key).and_then(|e| e.get(revision_field));
            if !is_newer_revision(entity.get(revision_field), current) {
                return false;
            }
            cache.write(key.clone(), entity);
            true
        });

        if written {
            MergeOutcome::Merged
        } else {
            log::debug!("Discarding stale fetch of {key}");
            MergeOutcome::Stale
        }
    }

    /// Merge every notification from `notifications` until it ends. Point-fetches for different
    /// notifications run concurrently.
    pub async fn drive_notifications(&self, notifications: impl Stream<Item = Notification>) {
        notifications
            .for_each_concurrent(None, |notification| async move {
                self.merge_notification(&notification).await;
            })
            .await;
    }
}

impl<T: Transport + 'static, S: DurableStore + 'static> Engine<T, S> {
    /// Subscribe through the transport and merge its notifications on a local task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a [`tokio::task::LocalSet`].
    pub fn spawn_subscription(
        self: &Rc<Self>,
        operation: &Operation,
        variables: &Value,
    ) -> SubscriptionHandle {
        let notifications = self.transport.subscribe(operation, variables);
        let engine = self.clone();
        let name = operation.name.clone();
        let task = tokio::task::spawn_local({
            let name = name.clone();
            async move {
                engine.drive_notifications(notifications).await;
                log::debug!("Subscription {name} ended");
            }
        });
        SubscriptionHandle { name, task }
    }
}

/// A running subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    name: String,
    task: tokio::task::JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Keeps an entity in the refreshing set for as long as it lives, including when the merge is
/// abandoned mid-fetch.
struct RefreshingGuard<'a, T: Transport, S: DurableStore> {
    engine: &'a Engine<T, S>,
    key: EntityKey,
}

impl<'a, T: Transport, S: DurableStore> RefreshingGuard<'a, T, S> {
    fn new(engine: &'a Engine<T, S>, key: EntityKey) -> Self {
        engine.set_refreshing(&key, true);
        Self { engine, key }
    }
}

impl<T: Transport, S: DurableStore> Drop for RefreshingGuard<'_, T, S> {
    fn drop(&mut self) {
        self.engine.set_refreshing(&self.key, false);
    }
}

/// Parse a revision as an RFC 3339 timestamp or integer epoch milliseconds.
pub fn parse_revision(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// True unless both revisions are readable and the incoming one is not strictly newer.
pub fn is_newer_revision(incoming: Option<&Value>, current: Option<&Value>) -> bool {
    match (
        incoming.and_then(parse_revision),
        current.and_then(parse_revision),
    ) {
        (Some(incoming), Some(current)) => incoming > current,
        _ => true,
    }
}
