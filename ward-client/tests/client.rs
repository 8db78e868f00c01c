use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::LocalBoxStream;
use optimist::{
    Cache, DurableStore, EngineConfig, MemoryStore, MutationError, Notification, Operation,
    PendingMutationRecord, Transport, TransportError,
};
use serde_json::{Value, json};
use ward_client::entities::{patient_key, task_key};
use ward_client::payload::notifications;
use ward_client::{DialogChoice, PatientState, Topic, WardClient};

type Reply = Result<Option<Value>, TransportError>;

/// Answers from queues, and forwards raw subscription messages through the payload parser the
/// way a websocket transport would.
#[derive(Default)]
struct FakeServer {
    fetches: RefCell<HashMap<String, VecDeque<Reply>>>,
    mutations: RefCell<VecDeque<Reply>>,
    channels: RefCell<HashMap<String, mpsc::UnboundedReceiver<Value>>>,
    sent: RefCell<Vec<(String, Value)>>,
}

impl FakeServer {
    fn reply_to_fetch(&self, operation: &str, reply: Reply) {
        self.fetches
            .borrow_mut()
            .entry(operation.to_string())
            .or_default()
            .push_back(reply);
    }

    fn reply_to_mutation(&self, reply: Reply) {
        self.mutations.borrow_mut().push_back(reply);
    }

    fn channel(&self, topic: Topic) -> mpsc::UnboundedSender<Value> {
        let (tx, rx) = mpsc::unbounded();
        self.channels
            .borrow_mut()
            .insert(topic.operation_name().to_string(), rx);
        tx
    }
}

impl Transport for FakeServer {
    async fn fetch(&self, operation: &Operation, _variables: &Value) -> Reply {
        let reply = self
            .fetches
            .borrow_mut()
            .get_mut(&operation.name)
            .and_then(VecDeque::pop_front);
        reply.unwrap_or_else(|| Err(TransportError::new("offline")))
    }

    async fn mutate(&self, operation: &Operation, variables: &Value) -> Reply {
        self.sent
            .borrow_mut()
            .push((operation.name.clone(), variables.clone()));
        let reply = self.mutations.borrow_mut().pop_front();
        reply.unwrap_or_else(|| Err(TransportError::new("offline")))
    }

    fn subscribe(&self, operation: &Operation, _variables: &Value) -> LocalBoxStream<'static, Notification> {
        let Some(topic) = Topic::from_operation_name(&operation.name) else {
            return futures::stream::empty().boxed_local();
        };
        match self.channels.borrow_mut().remove(&operation.name) {
            Some(rx) => notifications(topic, rx),
            None => futures::stream::pending().boxed_local(),
        }
    }
}

type Client = WardClient<FakeServer, Rc<MemoryStore>>;

fn client(store: &Rc<MemoryStore>) -> Rc<Client> {
    Rc::new(WardClient::new(
        FakeServer::default(),
        store.clone(),
        EngineConfig::default(),
    ))
}

fn seed(client: &Client) {
    client.engine().update_cache(|cache| {
        cache.write(
            task_key("t1"),
            json!({ "id": "t1", "title": "Round", "done": false, "updateDate": "2025-03-01T08:00:00Z" }),
        );
    });
}

async fn run_local<F: std::future::Future>(future: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(future).await
}

async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition was never reached");
}

fn conflict() -> Reply {
    Err(TransportError::with_extensions(
        "CONFLICT: Expected checksum: aa Got: bb",
        json!({ "code": "CONFLICT" }),
    ))
}

#[tokio::test]
async fn start_replays_the_outbox_before_subscribing() {
    run_local(async {
        let store = Rc::new(MemoryStore::new());
        let mut cache = Cache::new();
        cache.write(task_key("t1"), json!({ "id": "t1", "done": false }));
        store.put_snapshot(&cache.extract()).await.unwrap();
        store
            .put_pending(&PendingMutationRecord {
                client_mutation_id: "m1".to_string(),
                operation: ward_client::operations::complete_task(),
                variables: json!({ "id": "t1", "clientMutationId": "m1" }),
                plan_key: "CompleteTask".to_string(),
                entity_type: Some("Task".to_string()),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let client = client(&store);
        let report = client.start().await;

        assert!(report.restored);
        assert_eq!(report.replayed, 1);
        assert_eq!(
            client.engine().read_entity(&task_key("t1")).unwrap()["done"],
            json!(true)
        );
        assert!(client.engine().has_pending_for_entity("Task", "t1"));

        let mut names = client.subscription_names();
        names.sort();
        assert_eq!(names, vec!["PatientCreated", "PatientUpdated", "TaskUpdated"]);
    })
    .await;
}

#[tokio::test]
async fn keeping_local_changes_resends_after_a_conflict() {
    run_local(async {
        let store = Rc::new(MemoryStore::new());
        let client = client(&store);
        seed(&client);

        let server = client.engine().transport();
        server.reply_to_mutation(conflict());
        server.reply_to_mutation(Ok(Some(json!({ "completeTask": { "id": "t1", "done": true } }))));

        let completing = tokio::task::spawn_local({
            let client = client.clone();
            async move { client.complete_task("t1").await }
        });
        until(|| client.conflicts().is_open()).await;

        let request = client.conflicts().current().unwrap();
        assert_eq!(
            request.conflict.and_then(|c| c.got_checksum),
            Some("bb".to_string())
        );
        // The failed attempt is already rolled back while the prompt is open.
        assert_eq!(
            client.engine().read_entity(&task_key("t1")).unwrap()["done"],
            json!(false)
        );

        assert!(client.conflicts().resolve(DialogChoice::KeepLocal));
        completing.await.unwrap().unwrap();

        let sent = server.sent.borrow();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].1["clientMutationId"], sent[1].1["clientMutationId"]);
        assert_eq!(
            client.engine().read_entity(&task_key("t1")).unwrap()["done"],
            json!(true)
        );
    })
    .await;
}

#[tokio::test]
async fn dismissing_the_prompt_fails_the_mutation() {
    run_local(async {
        let store = Rc::new(MemoryStore::new());
        let client = client(&store);
        seed(&client);
        client.engine().transport().reply_to_mutation(conflict());

        let assigning = tokio::task::spawn_local({
            let client = client.clone();
            async move { client.assign_task("t1", "u9").await }
        });
        until(|| client.conflicts().is_open()).await;
        assert!(client.conflicts().cancel());

        match assigning.await.unwrap() {
            Err(MutationError::ConflictResolution(reason)) => {
                assert_eq!(reason, ward_client::conflict::CANCELLED)
            }
            other => panic!("expected a failed resolution, got {other:?}"),
        }
        assert!(client.engine().pending_mutations().is_empty());
        assert_eq!(
            client.engine().read_entity(&task_key("t1")).unwrap().get("assignee"),
            None
        );
    })
    .await;
}

#[tokio::test]
async fn pushed_changes_are_fetched_into_the_cache() {
    run_local(async {
        let store = Rc::new(MemoryStore::new());
        let client = client(&store);
        let server = client.engine().transport();
        let patient_updates = server.channel(Topic::PatientUpdated);
        server.reply_to_fetch(
            "GetPatient",
            Ok(Some(json!({
                "patient": { "id": "p1", "firstname": "Ada", "state": "WAIT", "updateDate": "2025-03-01T09:00:00Z" }
            }))),
        );

        client.start().await;
        patient_updates
            .unbounded_send(json!({ "data": { "patientUpdated": "p1" } }))
            .unwrap();
        until(|| client.engine().read_entity(&patient_key("p1")).is_some()).await;

        server.reply_to_mutation(Ok(Some(json!({ "admitPatient": { "id": "p1" } }))));
        client
            .set_patient_state("p1", PatientState::Admitted)
            .await
            .unwrap();
        assert_eq!(
            client.engine().read_entity(&patient_key("p1")).unwrap()["state"],
            json!("ADMITTED")
        );

        // The server's echo of that write is recognised without a refetch.
        patient_updates
            .unbounded_send(json!({ "data": { "patientUpdated": "p1" } }))
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(
            client.engine().read_entity(&patient_key("p1")).unwrap()["state"],
            json!("ADMITTED")
        );
    })
    .await;
}

#[tokio::test]
async fn shutdown_flushes_the_snapshot() {
    run_local(async {
        let store = Rc::new(MemoryStore::new());
        let client = client(&store);
        client.start().await;
        seed(&client);

        client.shutdown().await;
        assert!(client.subscription_names().is_empty());
        let snapshot = store.snapshot().await.unwrap().unwrap();
        assert!(snapshot.entities.contains_key(&task_key("t1")));
    })
    .await;
}
