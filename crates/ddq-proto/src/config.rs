//! Backend configuration.
//!
//! Keys follow the names queue plugins have always accepted
//! (`pollingDelayMs`, `heartbeatLifetimeSeconds`, ...), so an existing plugin
//! config file deserializes without translation.

use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration handed to a backend instance.
///
/// This is a plain value. Every instance receives its own copy, so changing
/// the owner of one instance can never leak into another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub table: String,

    /// Identity of the consumer holding leases.
    pub owner: String,

    /// Topic messages are sent to and polled from.
    #[serde(alias = "topic")]
    pub topics: String,

    /// Delay between poll cycles.
    pub polling_delay_ms: u64,

    /// How long a delivered message stays leased without a heartbeat.
    pub heartbeat_lifetime_seconds: u64,

    /// Delay between runs of the lease restorer.
    pub heartbeat_cleanup_delay_ms: u64,

    /// Maximum number of messages claimed per poll cycle.
    pub create_message_cycle_limit: u32,

    /// Retries allowed when claiming a message contends with another owner.
    pub deadlock_count_limit: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: Some("root".to_string()),
            database: "testQueue".to_string(),
            table: "queue".to_string(),
            owner: "tester".to_string(),
            topics: "Test Topic".to_string(),
            polling_delay_ms: 500,
            heartbeat_lifetime_seconds: 1,
            heartbeat_cleanup_delay_ms: 500,
            create_message_cycle_limit: 10,
            deadlock_count_limit: 5,
        }
    }
}

impl BackendConfig {
    /// Returns a copy of this config bound to a different owner.
    pub fn with_owner(&self, owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..self.clone()
        }
    }

    /// Returns the poll interval.
    pub fn polling_delay(&self) -> Duration {
        Duration::from_millis(self.polling_delay_ms)
    }

    /// Returns the lease lifetime.
    pub fn heartbeat_lifetime(&self) -> Duration {
        Duration::from_secs(self.heartbeat_lifetime_seconds)
    }

    /// Returns the restorer interval.
    pub fn heartbeat_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.heartbeat_cleanup_delay_ms)
    }

    /// Returns the `database.table` key identifying the queue.
    pub fn queue_key(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    /// Checks that every delay and limit is usable.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.owner.is_empty() {
            return Err(BackendError::InvalidConfig("owner must not be empty".into()));
        }
        if self.topics.is_empty() {
            return Err(BackendError::InvalidConfig("topics must not be empty".into()));
        }

        let positive = [
            ("pollingDelayMs", self.polling_delay_ms),
            ("heartbeatLifetimeSeconds", self.heartbeat_lifetime_seconds),
            ("heartbeatCleanupDelayMs", self.heartbeat_cleanup_delay_ms),
            (
                "createMessageCycleLimit",
                u64::from(self.create_message_cycle_limit),
            ),
            ("deadlockCountLimit", u64::from(self.deadlock_count_limit)),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(BackendError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_manual_testing_values() {
        let config = BackendConfig::default();
        assert_eq!(config.owner, "tester");
        assert_eq!(config.topics, "Test Topic");
        assert_eq!(config.heartbeat_lifetime(), Duration::from_secs(1));
        assert_eq!(config.polling_delay(), Duration::from_millis(500));
        assert_eq!(config.queue_key(), "testQueue.queue");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_owner_copies() {
        let base = BackendConfig::default();
        let second = base.with_owner("testerTwo");

        assert_eq!(base.owner, "tester");
        assert_eq!(second.owner, "testerTwo");
        assert_eq!(second.topics, base.topics);
    }

    #[test]
    fn test_deserialize_camel_case_with_topic_alias() {
        let json = r#"{
            "database": "otherQueue",
            "topic": "Jobs",
            "pollingDelayMs": 150,
            "heartbeatLifetimeSeconds": 5
        }"#;
        let config: BackendConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.database, "otherQueue");
        assert_eq!(config.topics, "Jobs");
        assert_eq!(config.polling_delay_ms, 150);
        assert_eq!(config.heartbeat_lifetime_seconds, 5);
        // Unspecified keys fall back to defaults
        assert_eq!(config.table, "queue");
    }

    #[test]
    fn test_deserialize_yaml() {
        let yaml = r#"
owner: worker
topics: Test Topic
heartbeatCleanupDelayMs: 100
"#;
        let config: BackendConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.owner, "worker");
        assert_eq!(config.heartbeat_cleanup_delay_ms, 100);
    }

    #[test]
    fn test_validate_rejects_zero_delay() {
        let config = BackendConfig {
            polling_delay_ms: 0,
            ..BackendConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pollingDelayMs"));
    }

    #[test]
    fn test_validate_rejects_empty_owner() {
        let config = BackendConfig::default().with_owner("");
        assert!(config.validate().is_err());
    }
}
