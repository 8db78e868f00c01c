use serde_json::Value;

use crate::cache::EntityKey;

/// A failed transport call. `extensions` carries any structured error details the server sent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub extensions: Option<Value>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            extensions: None,
        }
    }

    pub fn with_extensions(message: impl Into<String>, extensions: Value) -> Self {
        Self {
            message: message.into(),
            extensions: Some(extensions),
        }
    }

    fn extension_str(&self, field: &str) -> Option<&str> {
        self.extensions.as_ref()?.get(field)?.as_str()
    }
}

/// Details of a write that collided with newer server state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub message: String,
    pub expected_checksum: Option<String>,
    pub got_checksum: Option<String>,
}

impl ConflictInfo {
    /// Recognise the server's conflict shape: `extensions.code == "CONFLICT"` or a message
    /// mentioning `CONFLICT`. Checksums come from the extensions, falling back to the message.
    pub fn from_transport_error(error: &TransportError) -> Option<Self> {
        let coded = error.extension_str("code") == Some("CONFLICT");
        if !coded && !error.message.contains("CONFLICT") {
            return None;
        }

        let expected_checksum = error
            .extension_str("expectedChecksum")
            .map(str::to_string)
            .or_else(|| token_after(&error.message, "Expected checksum: "));
        let got_checksum = error
            .extension_str("gotChecksum")
            .map(str::to_string)
            .or_else(|| token_after(&error.message, "Got: "));

        Some(Self {
            message: error.message.clone(),
            expected_checksum,
            got_checksum,
        })
    }
}

fn token_after(message: &str, marker: &str) -> Option<String> {
    let (_, rest) = message.split_once(marker)?;
    let token: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ',')
        .collect();
    (!token.is_empty()).then_some(token)
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("variables are missing `{0}`")]
    MissingVariable(String),

    #[error("variable `{field}` is invalid: {reason}")]
    InvalidVariable { field: String, reason: String },

    #[error("cached entity {0} is not a JSON object")]
    NotAnObject(EntityKey),

    #[error("{0}")]
    Custom(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("mutation variables must be a JSON object")]
    InvalidVariables,

    #[error("no optimistic plan is registered under `{0}`")]
    UnknownPlan(String),

    #[error("optimistic update failed: {0}")]
    Patch(#[source] PatchError),

    #[error("mutation failed: {0}")]
    Transport(#[source] TransportError),

    #[error("mutation returned no data")]
    EmptyResponse,

    #[error("mutation conflicted with newer server state: {}", .0.message)]
    Conflict(ConflictInfo),

    #[error("conflict resolution failed: {0}")]
    ConflictResolution(String),
}

impl MutationError {
    /// Classify a transport failure, promoting recognised conflicts.
    pub fn from_transport(error: TransportError) -> Self {
        match ConflictInfo::from_transport_error(&error) {
            Some(info) => MutationError::Conflict(info),
            None => MutationError::Transport(error),
        }
    }

    pub fn conflict(&self) -> Option<&ConflictInfo> {
        match self {
            MutationError::Conflict(info) => Some(info),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("durable storage is unavailable")]
    Unavailable,

    #[error("corrupt durable data: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conflict_from_extensions() {
        let error = TransportError::with_extensions(
            "write rejected",
            json!({ "code": "CONFLICT", "expectedChecksum": "abc", "gotChecksum": "def" }),
        );
        let info = ConflictInfo::from_transport_error(&error).unwrap();
        assert_eq!(info.expected_checksum.as_deref(), Some("abc"));
        assert_eq!(info.got_checksum.as_deref(), Some("def"));
    }

    #[test]
    fn conflict_checksums_fall_back_to_message() {
        let error =
            TransportError::new("CONFLICT: Expected checksum: 1a2b, Got: 3c4d while updating");
        let info = ConflictInfo::from_transport_error(&error).unwrap();
        assert_eq!(info.expected_checksum.as_deref(), Some("1a2b"));
        assert_eq!(info.got_checksum.as_deref(), Some("3c4d"));
    }

    #[test]
    fn plain_failures_are_not_conflicts() {
        let error = TransportError::new("connection reset");
        assert!(ConflictInfo::from_transport_error(&error).is_none());
        assert!(matches!(
            MutationError::from_transport(error),
            MutationError::Transport(_)
        ));
    }
}
