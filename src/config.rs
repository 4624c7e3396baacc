//! Cluster configuration.
//!
//! Every process loads the same YAML tree; each component reads its own
//! section. Addresses are `host:port` strings, periods are seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configuration failure. Maps to process exit code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config file: {source}")]
    Io {
        /// Underlying I/O failure.
        #[from]
        source: std::io::Error,
    },
    /// The config file is not valid YAML for the expected tree.
    #[error("cannot parse config file: {source}")]
    Parse {
        /// Underlying YAML failure.
        #[from]
        source: serde_yaml::Error,
    },
    /// A value is present but unusable.
    #[error("invalid configuration: {field} - {reason}")]
    Invalid {
        /// Dotted key of the offending value.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// The full configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Location registry process section.
    pub location_manager: LocationManagerConfig,
    /// Broker device section.
    pub message_broker: MessageBrokerConfig,
    /// Location gateway section.
    pub location: LocationConfig,
    /// Front-end section.
    pub outer_server: OuterServerConfig,
    /// Application user defaults.
    #[serde(default)]
    pub user: UserConfig,
}

/// Addresses and liveness tuning of the location registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationManagerConfig {
    /// Request/reply endpoint (CONNECT, GET_LOCATIONS).
    pub rep_address: String,
    /// Ingress endpoint (heartbeats, disconnects).
    pub pull_address: String,
    /// Announcement pub endpoint.
    pub pub_address: String,
    /// Sweeper period in seconds.
    pub heartbeats_checker_period: f64,
    /// Silence after which a location is declared DEAD, in seconds.
    pub max_heartbeat_silence: f64,
}

impl LocationManagerConfig {
    /// Sweeper period as a [`Duration`].
    pub fn checker_period(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeats_checker_period)
    }

    /// Max heartbeat silence as a [`Duration`].
    pub fn max_silence(&self) -> Duration {
        Duration::from_secs_f64(self.max_heartbeat_silence)
    }
}

/// Addresses of the broker device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBrokerConfig {
    /// Ingress side: publishers connect here.
    pub sub_address: String,
    /// Egress side: subscribers connect here.
    pub pub_address: String,
}

/// Tuning of a location gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Heartbeat period in seconds.
    pub heartbeat_period: f64,
}

impl LocationConfig {
    /// Heartbeat period as a [`Duration`].
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_period)
    }
}

/// Front-end path prefixes for traffic originating in locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterServerConfig {
    /// Prefix prepended to private location messages before they are
    /// dispatched on the front-end root.
    pub location_handler_path: String,
    /// Prefix prepended to public location messages before they are
    /// forwarded to clients.
    pub client_location_handler_path: String,
}

/// Application user defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    /// Locations a fresh user may be placed into.
    #[serde(default)]
    pub start_locations: Vec<String>,
}

impl Config {
    /// Loads and validates a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the tree for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn non_empty(field: &'static str, value: &str) -> Result<(), ConfigError> {
            if value.is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "address must not be empty".to_owned(),
                });
            }
            Ok(())
        }

        non_empty("location_manager.rep_address", &self.location_manager.rep_address)?;
        non_empty("location_manager.pull_address", &self.location_manager.pull_address)?;
        non_empty("location_manager.pub_address", &self.location_manager.pub_address)?;
        non_empty("message_broker.sub_address", &self.message_broker.sub_address)?;
        non_empty("message_broker.pub_address", &self.message_broker.pub_address)?;

        if self.location_manager.heartbeats_checker_period <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "location_manager.heartbeats_checker_period",
                reason: "must be positive".to_owned(),
            });
        }
        if self.location_manager.max_heartbeat_silence <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "location_manager.max_heartbeat_silence",
                reason: "must be positive".to_owned(),
            });
        }
        if self.location.heartbeat_period <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "location.heartbeat_period",
                reason: "must be positive".to_owned(),
            });
        }
        if self.location_manager.max_heartbeat_silence <= self.location.heartbeat_period {
            return Err(ConfigError::Invalid {
                field: "location_manager.max_heartbeat_silence",
                reason: "must exceed location.heartbeat_period".to_owned(),
            });
        }
        Ok(())
    }
}
