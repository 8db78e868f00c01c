use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::Value;

use crate::cache::{Cache, CacheChange, CacheSnapshot, EntityKey, QueryKey};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::TransportError;
use crate::listeners::{ListenerKey, Listeners, notify_all};
use crate::merge::{EntityQuery, MergeConfig};
use crate::plan::{OptimisticPlan, PlanRegistry};
use crate::queue::{PendingMutationRecord, PendingQueue};
use crate::status::{ConnectionState, ConnectionStatus, RefreshingEntities, RefreshingSnapshot};
use crate::store::DurableStore;
use crate::tracker::EchoTracker;
use crate::transport::{FetchPolicy, Operation, Transport};

pub(crate) struct ActiveQuery {
    pub(crate) operation: Operation,
    pub(crate) variables: Value,
    watchers: usize,
}

/// The single owning instance of the cache, the outbox mirror, the echo tracker and the plan
/// registry for one session.
///
/// All state sits behind `RefCell`s and no borrow is ever held across an `.await`, so any number
/// of mutations, merges and persistence tasks can be in flight at once on one thread. Methods
/// that spawn background work take `self: &Rc<Self>` and must be called inside a
/// [`tokio::task::LocalSet`].
pub struct Engine<T, S> {
    pub(crate) transport: T,
    pub(crate) store: S,
    pub(crate) config: EngineConfig,
    pub(crate) clock: Rc<dyn Clock>,

    pub(crate) cache: RefCell<Cache>,
    pub(crate) queue: RefCell<PendingQueue>,
    pub(crate) tracker: RefCell<EchoTracker>,
    pub(crate) registry: RefCell<PlanRegistry>,

    pub(crate) entity_queries: RefCell<HashMap<String, EntityQuery>>,
    pub(crate) merge_config: RefCell<MergeConfig>,
    pub(crate) active_queries: RefCell<BTreeMap<QueryKey, ActiveQuery>>,

    pub(crate) refreshing: RefCell<RefreshingEntities>,
    pub(crate) connection: RefCell<ConnectionState>,
    cache_listeners: RefCell<Listeners<[CacheChange]>>,

    pub(crate) persist_task: RefCell<Option<tokio::task::JoinHandle<()>>>,
}

impl<T: Transport, S: DurableStore> Engine<T, S> {
    pub fn new(transport: T, store: S, config: EngineConfig) -> Self {
        Self {
            queue: RefCell::new(PendingQueue::new(config.target_id_field.clone())),
            tracker: RefCell::new(EchoTracker::new(config.echo_window())),
            transport,
            store,
            config,
            clock: Rc::new(SystemClock),
            cache: RefCell::default(),
            registry: RefCell::default(),
            entity_queries: RefCell::default(),
            merge_config: RefCell::default(),
            active_queries: RefCell::default(),
            refreshing: RefCell::default(),
            connection: RefCell::default(),
            cache_listeners: RefCell::default(),
            persist_task: RefCell::new(None),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Rc::new(clock);
        self
    }

    pub fn with_registry(self, registry: PlanRegistry) -> Self {
        *self.registry.borrow_mut() = registry;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn register_plan(&self, key: impl Into<String>, plan: impl OptimisticPlan + 'static) {
        self.registry.borrow_mut().register(key, plan);
    }

    pub fn has_plan(&self, key: &str) -> bool {
        self.registry.borrow().contains(key)
    }

    /// Tell the merge handler how to point-fetch entities of `entity_type`.
    pub fn register_entity_query(&self, entity_type: impl Into<String>, query: EntityQuery) {
        self.entity_queries
            .borrow_mut()
            .insert(entity_type.into(), query);
    }

    pub fn set_merge_config(&self, merge_config: MergeConfig) {
        *self.merge_config.borrow_mut() = merge_config;
    }

    /// Run `f` against the cache, then notify cache listeners once the borrow is released.
    pub fn update_cache<R>(&self, f: impl FnOnce(&mut Cache) -> R) -> R {
        let (result, changes) = {
            let mut cache = self.cache.borrow_mut();
            let result = f(&mut cache);
            (result, cache.take_changes())
        };
        if !changes.is_empty() {
            let callbacks = self.cache_listeners.borrow().snapshot();
            notify_all(callbacks, changes.as_slice());
        }
        result
    }

    pub fn read_entity(&self, key: &EntityKey) -> Option<Value> {
        self.cache.borrow().read(key).cloned()
    }

    pub fn read_query(&self, operation: &Operation, variables: &Value) -> Option<Value> {
        self.cache
            .borrow()
            .read_query(&QueryKey::new(operation, variables))
            .cloned()
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        self.cache.borrow().extract()
    }

    pub fn pending_mutations(&self) -> Vec<PendingMutationRecord> {
        self.queue.borrow().all()
    }

    pub fn has_pending_for_entity(&self, entity_type: &str, entity_id: &str) -> bool {
        self.queue
            .borrow()
            .has_pending_for_entity(entity_type, entity_id)
    }

    pub fn is_likely_echo(&self, key: &EntityKey, incoming_mutation_id: Option<&str>) -> bool {
        self.tracker
            .borrow()
            .is_likely_echo(key, incoming_mutation_id, self.clock.now())
    }

    pub fn is_refreshing(&self, entity_type: &str, entity_id: &str) -> bool {
        self.refreshing
            .borrow()
            .contains(&EntityKey::new(entity_type, entity_id))
    }

    pub fn refreshing_snapshot(&self) -> RefreshingSnapshot {
        self.refreshing.borrow().snapshot()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.borrow().get()
    }

    /// Called by the push transport from its connect, close and error callbacks.
    pub fn set_connection_status(&self, status: ConnectionStatus) {
        let callbacks = {
            let mut connection = self.connection.borrow_mut();
            if !connection.set(status) {
                return;
            }
            connection.listeners.snapshot()
        };
        notify_all(callbacks, &status);
    }

    pub fn register_cache_listener(
        &self,
        listener: impl Fn(&[CacheChange]) + 'static,
    ) -> ListenerKey {
        self.cache_listeners.borrow_mut().register(listener)
    }

    pub fn unregister_cache_listener(&self, key: ListenerKey) -> bool {
        self.cache_listeners.borrow_mut().unregister(key)
    }

    pub fn register_refreshing_listener(
        &self,
        listener: impl Fn(&RefreshingSnapshot) + 'static,
    ) -> ListenerKey {
        self.refreshing.borrow_mut().listeners.register(listener)
    }

    pub fn unregister_refreshing_listener(&self, key: ListenerKey) -> bool {
        self.refreshing.borrow_mut().listeners.unregister(key)
    }

    pub fn register_connection_listener(
        &self,
        listener: impl Fn(&ConnectionStatus) + 'static,
    ) -> ListenerKey {
        self.connection.borrow_mut().listeners.register(listener)
    }

    pub fn unregister_connection_listener(&self, key: ListenerKey) -> bool {
        self.connection.borrow_mut().listeners.unregister(key)
    }

    pub(crate) fn set_refreshing(&self, key: &EntityKey, refreshing: bool) {
        let callbacks = {
            let mut set = self.refreshing.borrow_mut();
            let changed = if refreshing {
                set.insert(key)
            } else {
                set.remove(key)
            };
            if !changed {
                return;
            }
            (set.listeners.snapshot(), set.snapshot())
        };
        notify_all(callbacks.0, &callbacks.1);
    }

    /// Mark a query as displayed, so it is refetched when server state must win.
    pub fn watch_query(&self, operation: &Operation, variables: &Value) -> QueryKey {
        let key = QueryKey::new(operation, variables);
        self.active_queries
            .borrow_mut()
            .entry(key.clone())
            .or_insert_with(|| ActiveQuery {
                operation: operation.clone(),
                variables: variables.clone(),
                watchers: 0,
            })
            .watchers += 1;
        key
    }

    pub fn unwatch_query(&self, key: &QueryKey) {
        let mut active = self.active_queries.borrow_mut();
        let Some(query) = active.get_mut(key) else {
            log::warn!("Unwatching query {key} which is not active");
            return;
        };
        query.watchers -= 1;
        if query.watchers == 0 {
            active.remove(key);
        }
    }

    pub fn active_query_keys(&self) -> Vec<QueryKey> {
        self.active_queries.borrow().keys().cloned().collect()
    }

    pub async fn query(
        &self,
        operation: &Operation,
        variables: &Value,
        policy: FetchPolicy,
    ) -> Result<Option<Value>, TransportError> {
        let key = QueryKey::new(operation, variables);
        if policy == FetchPolicy::CacheFirst {
            let cached = self.cache.borrow().read_query(&key).cloned();
            if cached.is_some() {
                return Ok(cached);
            }
        }

        let data = self.transport.fetch(operation, variables).await?;
        if let Some(data) = &data {
            self.update_cache(|cache| cache.write_query(key, data.clone()));
        }
        Ok(data)
    }

    /// Refetch every active query from the server. Failures are logged per query.
    pub async fn refetch_active_queries(&self) -> usize {
        self.refetch_active_where(|_| true).await
    }

    /// Refetch the active queries whose operation name is listed.
    pub async fn refetch_active_named(&self, names: &[String]) -> usize {
        if names.is_empty() {
            return 0;
        }
        self.refetch_active_where(|name| names.iter().any(|n| n == name))
            .await
    }

    async fn refetch_active_where(&self, include: impl Fn(&str) -> bool) -> usize {
        let queries: Vec<(Operation, Value)> = self
            .active_queries
            .borrow()
            .values()
            .filter(|q| include(&q.operation.name))
            .map(|q| (q.operation.clone(), q.variables.clone()))
            .collect();

        let mut refetched = 0;
        for (operation, variables) in queries {
            match self
                .query(&operation, &variables, FetchPolicy::NetworkOnly)
                .await
            {
                Ok(_) => refetched += 1,
                Err(e) => log::warn!("Failed to refetch active query {}: {e}", operation.name),
            }
        }
        refetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::store::MemoryStore;
    use crate::transport::Notification;
    use futures::stream::LocalBoxStream;
    use serde_json::json;
    use std::cell::Cell;

    struct CountingTransport {
        fetches: Cell<usize>,
    }

    impl Transport for CountingTransport {
        async fn fetch(
            &self,
            operation: &Operation,
            _variables: &Value,
        ) -> Result<Option<Value>, TransportError> {
            self.fetches.set(self.fetches.get() + 1);
            Ok(Some(json!({ "op": operation.name, "n": self.fetches.get() })))
        }

        async fn mutate(
            &self,
            _operation: &Operation,
            _variables: &Value,
        ) -> Result<Option<Value>, TransportError> {
            Err(TransportError::new("not used"))
        }

        fn subscribe(
            &self,
            _operation: &Operation,
            _variables: &Value,
        ) -> LocalBoxStream<'static, Notification> {
            Box::pin(futures::stream::empty())
        }
    }

    fn engine() -> Engine<CountingTransport, MemoryStore> {
        Engine::new(
            CountingTransport {
                fetches: Cell::new(0),
            },
            MemoryStore::new(),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn cache_first_only_fetches_once() {
        let engine = engine();
        let op = Operation::new("GetTasks", "query GetTasks");
        let vars = json!({});

        engine
            .query(&op, &vars, FetchPolicy::CacheFirst)
            .await
            .unwrap();
        engine
            .query(&op, &vars, FetchPolicy::CacheFirst)
            .await
            .unwrap();
        assert_eq!(engine.transport().fetches.get(), 1);

        let fresh = engine
            .query(&op, &vars, FetchPolicy::NetworkOnly)
            .await
            .unwrap();
        assert_eq!(fresh, Some(json!({ "op": "GetTasks", "n": 2 })));
        assert_eq!(engine.read_query(&op, &vars), fresh);
    }

    #[tokio::test]
    async fn only_watched_queries_are_refetched() {
        let engine = engine();
        let tasks = Operation::new("GetTasks", "");
        let globals = Operation::new("GetGlobalData", "");

        let tasks_key = engine.watch_query(&tasks, &json!({}));
        engine.watch_query(&tasks, &json!({}));
        engine.watch_query(&globals, &json!({}));

        assert_eq!(engine.refetch_active_queries().await, 2);
        assert_eq!(
            engine
                .refetch_active_named(&["GetGlobalData".to_string()])
                .await,
            1
        );

        engine.unwatch_query(&tasks_key);
        assert_eq!(engine.active_query_keys().len(), 2);
        engine.unwatch_query(&tasks_key);
        assert_eq!(engine.active_query_keys().len(), 1);
    }

    #[test]
    fn listeners_see_changes_after_the_borrow_ends() {
        let engine = Rc::new(engine());
        let seen = Rc::new(Cell::new(0));
        {
            let engine_for_listener = Rc::downgrade(&engine);
            let seen = seen.clone();
            engine.register_cache_listener(move |changes| {
                if let Some(engine) = engine_for_listener.upgrade() {
                    // Reading inside a listener must not panic on a held borrow.
                    let _ = engine.cache_snapshot();
                }
                seen.set(seen.get() + changes.len());
            });
        }

        engine.update_cache(|cache| {
            cache.write(EntityKey::new("Task", "t1"), json!({}));
            cache.write(EntityKey::new("Task", "t2"), json!({}));
        });
        assert_eq!(seen.get(), 2);
    }

    #[test]
    fn connection_listeners_fire_only_on_change() {
        let engine = engine();
        let changes = Rc::new(RefCell::new(Vec::new()));
        {
            let changes = changes.clone();
            engine.register_connection_listener(move |status| changes.borrow_mut().push(*status));
        }

        engine.set_connection_status(ConnectionStatus::Connecting);
        engine.set_connection_status(ConnectionStatus::Connecting);
        engine.set_connection_status(ConnectionStatus::Connected);
        engine.set_connection_status(ConnectionStatus::Disconnected);

        assert_eq!(
            *changes.borrow(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected
            ]
        );
    }
}
