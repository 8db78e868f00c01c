//! The boundary to the server. The engine never cares how operations travel over the wire.

use futures::stream::LocalBoxStream;
use serde_json::Value;

use crate::error::TransportError;

/// A transport-opaque description of a query, mutation or subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Operation {
    pub name: String,
    pub document: String,
}

impl Operation {
    pub fn new(name: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            document: document.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Created,
    Updated,
    Deleted,
}

/// A server push saying an entity changed.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub entity_type: String,
    pub entity_id: String,
    /// Correlation id of the mutation that caused the change, when the server echoes it.
    #[serde(default)]
    pub client_mutation_id: Option<String>,
    /// Revision of the entity after the change. When the cache already holds this revision or a
    /// newer one, the point-fetch is skipped.
    #[serde(default)]
    pub revision: Option<Value>,
}

impl Notification {
    pub fn updated(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Updated,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            client_mutation_id: None,
            revision: None,
        }
    }

    pub fn with_kind(mut self, kind: NotificationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_client_mutation_id(mut self, id: impl Into<String>) -> Self {
        self.client_mutation_id = Some(id.into());
        self
    }

    pub fn with_revision(mut self, revision: Value) -> Self {
        self.revision = Some(revision);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Serve a cached result when there is one.
    #[default]
    CacheFirst,
    /// Always go to the server, bypassing the cache.
    NetworkOnly,
}

/// Calls the server. Each call either succeeds or fails once; retries are not the transport's job.
///
/// `Ok(None)` means the server answered without data.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn fetch(
        &self,
        operation: &Operation,
        variables: &Value,
    ) -> Result<Option<Value>, TransportError>;

    async fn mutate(
        &self,
        operation: &Operation,
        variables: &Value,
    ) -> Result<Option<Value>, TransportError>;

    fn subscribe(
        &self,
        operation: &Operation,
        variables: &Value,
    ) -> LocalBoxStream<'static, Notification>;
}
