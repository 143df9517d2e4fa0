//! Immutable configuration for nodes, services and segments
//!
//! All options are enumerated here and consumed at creation time. Builders
//! copy what they need into fixed descriptors; nothing refers back to a
//! `Config` after construction.

use std::{path::PathBuf, str::FromStr, time::Duration};

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::error::{EaselError, Result};

/// What an opener does with a segment whose attached processes are all dead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Unlink the stale segment and create a fresh one under the same name
    ReuseIfStale,
    /// Fail with `StaleSegment`; an operator has to remove it
    RejectStale,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::ReuseIfStale
    }
}

/// Top level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings shared by all segments
    pub global: GlobalConfig,
    /// Defaults applied by service builders
    pub defaults: ServiceDefaults,
    /// Node behaviour
    pub node: NodeConfig,
}

/// Settings shared by every segment a node touches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Directory holding the segment files
    pub root_dir: PathBuf,
    /// Prefix of every segment file name
    pub prefix: String,
    /// Policy for segments left behind by crashed processes
    pub recovery_policy: RecoveryPolicy,
    /// How long an opener waits for a concurrent creator
    #[serde(with = "millis")]
    pub init_timeout: Duration,
    /// Capacity of the service registry
    pub max_services: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            prefix: "easel_".to_string(),
            recovery_policy: RecoveryPolicy::default(),
            init_timeout: Duration::from_millis(500),
            max_services: 256,
        }
    }
}

fn default_root_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        shm
    } else {
        std::env::temp_dir()
    }
}

/// Per-pattern service defaults
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDefaults {
    pub publish_subscribe: PublishSubscribeDefaults,
    pub event: EventDefaults,
}

/// Defaults for publish-subscribe services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSubscribeDefaults {
    /// Number of slots in the sample pool
    pub pool_capacity: usize,
    /// Depth of each subscriber's receive queue
    pub subscriber_max_buffer_size: usize,
    pub max_publishers: usize,
    pub max_subscribers: usize,
    /// Samples a single publisher may hold loaned at once
    pub publisher_max_loans: usize,
    /// Maximum element count of slice payloads
    pub max_slice_len: usize,
}

impl Default for PublishSubscribeDefaults {
    fn default() -> Self {
        Self {
            pool_capacity: 32,
            subscriber_max_buffer_size: 8,
            max_publishers: 4,
            max_subscribers: 8,
            publisher_max_loans: 4,
            max_slice_len: 1,
        }
    }
}

/// Defaults for event services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventDefaults {
    pub max_notifiers: usize,
    pub max_listeners: usize,
    /// Largest event id a notifier may send
    pub event_id_max_value: usize,
}

impl Default for EventDefaults {
    fn default() -> Self {
        Self {
            max_notifiers: 16,
            max_listeners: 16,
            event_id_max_value: 255,
        }
    }
}

/// Node behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Signals that request a clean shutdown
    pub shutdown_signals: Vec<String>,
    /// Upper bound for a single sleep inside long blocking waits
    #[serde(with = "millis")]
    pub shutdown_check_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            shutdown_signals: vec!["SIGINT".to_string(), "SIGTERM".to_string()],
            shutdown_check_interval: Duration::from_millis(50),
        }
    }
}

impl NodeConfig {
    /// Resolve the configured signal names
    pub fn signals(&self) -> Result<Vec<Signal>> {
        self.shutdown_signals
            .iter()
            .map(|name| {
                Signal::from_str(name).map_err(|_| {
                    EaselError::invalid_parameter("shutdown_signals", format!("Unknown signal {}", name))
                })
            })
            .collect()
    }
}

impl Config {
    /// Parse a TOML document; missing keys fall back to defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EaselError::from_io(e, "Failed to read config file"))?;
        Self::from_toml_str(&content)
    }

    /// Same configuration with another root directory
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.global.root_dir = root_dir.into();
        self
    }

    /// Same configuration with another recovery policy
    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.global.recovery_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.global.prefix.is_empty() || self.global.prefix.contains('/') {
            return Err(EaselError::invalid_parameter(
                "prefix",
                "Prefix must be non-empty and must not contain '/'",
            ));
        }

        if self.global.max_services == 0 {
            return Err(EaselError::invalid_parameter(
                "max_services",
                "Registry capacity must be greater than 0",
            ));
        }

        let ps = &self.defaults.publish_subscribe;
        if ps.pool_capacity == 0 || ps.subscriber_max_buffer_size == 0 {
            return Err(EaselError::invalid_parameter(
                "publish_subscribe",
                "Pool capacity and subscriber buffer size must be greater than 0",
            ));
        }
        if ps.max_publishers == 0 || ps.max_subscribers == 0 || ps.publisher_max_loans == 0 {
            return Err(EaselError::invalid_parameter(
                "publish_subscribe",
                "Port limits and max loans must be greater than 0",
            ));
        }
        if ps.max_slice_len == 0 {
            return Err(EaselError::invalid_parameter(
                "max_slice_len",
                "Slice length bound must be greater than 0",
            ));
        }

        let ev = &self.defaults.event;
        if ev.max_notifiers == 0 || ev.max_listeners == 0 {
            return Err(EaselError::invalid_parameter(
                "event",
                "Port limits must be greater than 0",
            ));
        }

        self.node.signals()?;
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.global.recovery_policy, RecoveryPolicy::ReuseIfStale);
        assert_eq!(config.node.signals().unwrap(), vec![Signal::SIGINT, Signal::SIGTERM]);
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [global]
            prefix = "robot_"
            recovery_policy = "reject_stale"
            init_timeout = 250

            [defaults.publish_subscribe]
            pool_capacity = 64
            "#,
        )
        .unwrap();

        assert_eq!(config.global.prefix, "robot_");
        assert_eq!(config.global.recovery_policy, RecoveryPolicy::RejectStale);
        assert_eq!(config.global.init_timeout, Duration::from_millis(250));
        assert_eq!(config.defaults.publish_subscribe.pool_capacity, 64);
        assert_eq!(config.defaults.publish_subscribe.max_subscribers, 8);
        assert_eq!(config.defaults.event.event_id_max_value, 255);
    }

    #[test]
    fn test_invalid_config() {
        assert!(Config::from_toml_str("[defaults.publish_subscribe]\npool_capacity = 0").is_err());
        assert!(Config::from_toml_str("[node]\nshutdown_signals = [\"SIGBOGUS\"]").is_err());
        assert!(Config::from_toml_str("[global]\nprefix = \"a/b\"").is_err());
        assert!(matches!(
            Config::from_toml_str("[global\n"),
            Err(EaselError::Config { .. })
        ));
    }
}
