#![allow(dead_code)]

use std::cell::RefCell;
use std::future::Future;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use chrono::{DateTime, TimeZone, Utc};
use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use futures::stream::LocalBoxStream;
use optimist::{
    DurableStore, Engine, EngineConfig, EntityKey, EntityPatch, ManualClock, Notification, OptimisticPatch, Operation, Patches,
    PatchError, Transport, TransportError, plan::required_str,
};
use serde_json::{Map, Value, json};

pub type Reply = Result<Option<Value>, TransportError>;

enum Scripted {
    Ready(Reply),
    Wait(oneshot::Receiver<Reply>),
}

impl Scripted {
    async fn resolve(self) -> Reply {
        match self {
            Scripted::Ready(reply) => reply,
            Scripted::Wait(rx) => rx
                .await
                .unwrap_or_else(|_| Err(TransportError::new("reply dropped"))),
        }
    }
}

/// A transport whose every answer is queued up front by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    fetches: RefCell<HashMap<String, VecDeque<Scripted>>>,
    mutations: RefCell<VecDeque<Scripted>>,
    subscriptions: RefCell<HashMap<String, mpsc::UnboundedReceiver<Notification>>>,
    pub fetch_calls: RefCell<Vec<(String, Value)>>,
    pub mutate_calls: RefCell<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply_to_fetch(&self, operation: &str, reply: Reply) {
        self.fetches
            .borrow_mut()
            .entry(operation.to_string())
            .or_default()
            .push_back(Scripted::Ready(reply));
    }

    /// Queue a fetch reply that is only delivered when the returned sender fires.
    pub fn hold_fetch(&self, operation: &str) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.fetches
            .borrow_mut()
            .entry(operation.to_string())
            .or_default()
            .push_back(Scripted::Wait(rx));
        tx
    }

    pub fn reply_to_mutation(&self, reply: Reply) {
        self.mutations
            .borrow_mut()
            .push_back(Scripted::Ready(reply));
    }

    pub fn hold_mutation(&self) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.mutations.borrow_mut().push_back(Scripted::Wait(rx));
        tx
    }

    pub fn subscription(&self, operation: &str) -> mpsc::UnboundedSender<Notification> {
        let (tx, rx) = mpsc::unbounded();
        self.subscriptions
            .borrow_mut()
            .insert(operation.to_string(), rx);
        tx
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.borrow().len()
    }

    pub fn mutate_count(&self) -> usize {
        self.mutate_calls.borrow().len()
    }
}

impl Transport for ScriptedTransport {
    async fn fetch(&self, operation: &Operation, variables: &Value) -> Reply {
        self.fetch_calls
            .borrow_mut()
            .push((operation.name.clone(), variables.clone()));
        let scripted = self
            .fetches
            .borrow_mut()
            .get_mut(&operation.name)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(scripted) => scripted.resolve().await,
            None => Err(TransportError::new(format!(
                "no scripted reply for {}",
                operation.name
            ))),
        }
    }

    async fn mutate(&self, operation: &Operation, variables: &Value) -> Reply {
        self.mutate_calls
            .borrow_mut()
            .push((operation.name.clone(), variables.clone()));
        let scripted = self.mutations.borrow_mut().pop_front();
        match scripted {
            Some(scripted) => scripted.resolve().await,
            None => Err(TransportError::new("no scripted mutation reply")),
        }
    }

    fn subscribe(
        &self,
        operation: &Operation,
        _variables: &Value,
    ) -> LocalBoxStream<'static, Notification> {
        match self.subscriptions.borrow_mut().remove(&operation.name) {
            Some(rx) => rx.boxed_local(),
            None => futures::stream::empty().boxed_local(),
        }
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
}

pub fn clock() -> Rc<ManualClock> {
    Rc::new(ManualClock::new(t0()))
}

pub fn config() -> EngineConfig {
    EngineConfig::default()
}

pub fn task_key(id: &str) -> EntityKey {
    EntityKey::new("Task", id)
}

pub fn set_task_state() -> Operation {
    Operation::new("SetTaskState", "mutation SetTaskState($id: ID!, $state: String!)")
}

pub fn get_task() -> Operation {
    Operation::new("GetTask", "query GetTask($id: ID!)")
}

/// Sets `state` on the task named by `id`.
pub fn state_plan(variables: &Value) -> Result<Patches, PatchError> {
    let id = required_str(variables, "id")?;
    let state = required_str(variables, "state")?;
    let mut fields = Map::new();
    fields.insert("state".to_string(), json!(state));
    let patch: Box<dyn OptimisticPatch> = Box::new(EntityPatch::set_fields(task_key(id), fields));
    Ok(vec![patch])
}

/// Appends `tag` to the task's `tags` list, so replay order is observable.
pub fn tag_plan(variables: &Value) -> Result<Patches, PatchError> {
    let id = required_str(variables, "id")?;
    let tag = required_str(variables, "tag")?.to_string();
    let patch: Box<dyn OptimisticPatch> = Box::new(EntityPatch::new(task_key(id), move |task| {
        let tags = task.entry("tags").or_insert_with(|| json!([]));
        if let Value::Array(tags) = tags {
            tags.push(json!(tag));
        }
    }));
    Ok(vec![patch])
}

pub fn task(id: &str, state: &str, revision: &str) -> Value {
    json!({ "id": id, "state": state, "updateDate": revision })
}

pub fn engine_with<S: DurableStore>(
    store: S,
    clock: &Rc<ManualClock>,
) -> Rc<Engine<ScriptedTransport, S>> {
    engine_with_config(store, clock, config())
}

pub fn engine_with_config<S: DurableStore>(
    store: S,
    clock: &Rc<ManualClock>,
    config: EngineConfig,
) -> Rc<Engine<ScriptedTransport, S>> {
    let engine = Engine::new(ScriptedTransport::new(), store, config).with_clock(clock.clone());
    engine.register_plan("SetTaskState", state_plan);
    engine.register_plan("TagTask", tag_plan);
    Rc::new(engine)
}

pub async fn run_local<F: Future>(future: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(future).await
}

/// Yield to other local tasks until `condition` holds.
pub async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition was never reached");
}

/// Like [`until`], but sleeps between checks so blocking file I/O can finish.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition was never reached");
}
