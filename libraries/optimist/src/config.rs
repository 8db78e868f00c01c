use std::time::Duration;

use chrono::TimeDelta;

/// Whether a pending local mutation holds back incoming server merges for its entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Local state wins until the pending mutation resolves.
    #[default]
    Defer,
    /// Server notifications are merged even while a local mutation is in flight.
    ServerWins,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// How long after a mutation a correlation-less notification is still treated as its echo.
    pub echo_window_ms: u64,
    /// Quiet period before a scheduled cache snapshot is written.
    pub persist_debounce_ms: u64,
    pub conflict_strategy: ConflictStrategy,
    /// Variables field naming the entity a mutation targets.
    pub target_id_field: String,
    /// Variables field carrying the mutation's correlation id.
    pub correlation_field: String,
    /// Entity field compared when merging fetched server state.
    pub revision_field: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            echo_window_ms: 5000,
            persist_debounce_ms: 500,
            conflict_strategy: ConflictStrategy::Defer,
            target_id_field: "id".to_string(),
            correlation_field: "clientMutationId".to_string(),
            revision_field: "updateDate".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn echo_window(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.echo_window_ms.min(i64::MAX as u64) as i64)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{ "conflict_strategy": "server-wins" }"#).unwrap();
        assert_eq!(config.conflict_strategy, ConflictStrategy::ServerWins);
        assert_eq!(config.echo_window_ms, 5000);
        assert_eq!(config.persist_debounce(), Duration::from_millis(500));
        assert_eq!(config.correlation_field, "clientMutationId");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(EngineConfig::from_json_str(r#"{ "echo_window": 10 }"#).is_err());
    }
}
