//! # Subscription payloads
//! The server's change subscriptions carry little more than an entity id, in one of several
//! shapes depending on the transport. Transports use [`parse_message`] (or [`notifications`] for
//! a whole stream) to turn raw messages into engine notifications.

use futures::stream::LocalBoxStream;
use futures::{Stream, StreamExt};
use optimist::{Notification, NotificationKind, Operation};
use serde_json::Value;

use crate::entities::{PATIENT, TASK};
use crate::operations;

const CORRELATION_FIELD: &str = "clientMutationId";
const REVISION_FIELD: &str = "updateDate";

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("no entity id in {0} message")]
    MissingId(&'static str),
}

/// The subscriptions the client keeps open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    TaskUpdated,
    PatientUpdated,
    PatientCreated,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::TaskUpdated, Topic::PatientUpdated, Topic::PatientCreated];

    pub fn operation(self) -> Operation {
        match self {
            Topic::TaskUpdated => operations::task_updated(),
            Topic::PatientUpdated => operations::patient_updated(),
            Topic::PatientCreated => operations::patient_created(),
        }
    }

    pub fn from_operation_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.operation_name() == name)
    }

    pub fn operation_name(self) -> &'static str {
        match self {
            Topic::TaskUpdated => "TaskUpdated",
            Topic::PatientUpdated => "PatientUpdated",
            Topic::PatientCreated => "PatientCreated",
        }
    }

    /// The field of `data` holding the id.
    pub fn root_field(self) -> &'static str {
        match self {
            Topic::TaskUpdated => "taskUpdated",
            Topic::PatientUpdated => "patientUpdated",
            Topic::PatientCreated => "patientCreated",
        }
    }

    pub fn entity_type(self) -> &'static str {
        match self {
            Topic::TaskUpdated => TASK,
            Topic::PatientUpdated | Topic::PatientCreated => PATIENT,
        }
    }

    pub fn kind(self) -> NotificationKind {
        match self {
            Topic::PatientCreated => NotificationKind::Created,
            Topic::TaskUpdated | Topic::PatientUpdated => NotificationKind::Updated,
        }
    }
}

/// Find an entity id in a message that is a bare id string, `{ "data": { <field>: id } }` or
/// `{ "payload": id }`. For `data`, the first string field other than the correlation and
/// revision fields is taken.
pub fn extract_id(message: &Value) -> Option<&str> {
    if let Value::String(id) = message {
        return Some(id);
    }
    let from_data = message
        .get("data")
        .and_then(Value::as_object)
        .and_then(|data| {
            data.iter()
                .filter(|(field, _)| *field != CORRELATION_FIELD && *field != REVISION_FIELD)
                .find_map(|(_, value)| value.as_str())
        });
    from_data.or_else(|| message.get("payload").and_then(Value::as_str))
}

pub fn parse_message(topic: Topic, message: &Value) -> Result<Notification, PayloadError> {
    let data = message.get("data").and_then(Value::as_object);
    let id = data
        .and_then(|data| data.get(topic.root_field()))
        .and_then(Value::as_str)
        .or_else(|| extract_id(message))
        .ok_or(PayloadError::MissingId(topic.operation_name()))?;

    let mut notification = Notification::updated(topic.entity_type(), id).with_kind(topic.kind());
    if let Some(data) = data {
        if let Some(correlation) = data.get(CORRELATION_FIELD).and_then(Value::as_str) {
            notification = notification.with_client_mutation_id(correlation);
        }
        if let Some(revision) = data.get(REVISION_FIELD).filter(|r| !r.is_null()) {
            notification = notification.with_revision(revision.clone());
        }
    }
    Ok(notification)
}

/// Parse a stream of raw messages, dropping the ones without an id.
pub fn notifications(
    topic: Topic,
    messages: impl Stream<Item = Value> + 'static,
) -> LocalBoxStream<'static, Notification> {
    messages
        .filter_map(move |message| {
            let parsed = parse_message(topic, &message)
                .inspect_err(|e| log::debug!("Ignoring subscription message {message}: {e}"))
                .ok();
            futures::future::ready(parsed)
        })
        .boxed_local()
}
