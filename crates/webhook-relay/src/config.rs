//! Relay Configuration
//!
//! Settings are layered: built-in defaults, then a TOML file, then
//! `RELAY_`-prefixed environment variables. Command-line flags are applied
//! on top by the binary.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::fanout::{OverflowPolicy, RelayMode};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RELAY_";

/// Errors from loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Load(Box::new(e))
    }
}

/// What the ingress endpoint answers on a successful POST
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum IngressResponse {
    /// Return the request body verbatim
    #[default]
    Echo,
    /// Return `{"status":"accepted","id":"<event id>"}`
    Ack,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,

    /// How client-sent messages are relayed
    pub relay_mode: RelayMode,

    /// What to do when a subscriber's queue is full
    pub overflow_policy: OverflowPolicy,

    /// Per-connection outbound queue bound
    pub queue_capacity: usize,

    /// Dispatcher submission queue bound
    pub dispatch_capacity: usize,

    /// Largest accepted ingress body in bytes
    pub max_event_bytes: usize,

    /// Reject POST bodies that are not JSON
    pub require_json: bool,

    /// Ingress response body
    pub ingress_response: IngressResponse,

    /// Bound on draining sessions and the dispatcher at shutdown
    pub shutdown_timeout_secs: u64,

    /// Emit JSON log lines
    pub log_json: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9700,
            relay_mode: RelayMode::default(),
            overflow_policy: OverflowPolicy::default(),
            queue_capacity: 64,
            dispatch_capacity: 1024,
            max_event_bytes: 2 * 1024 * 1024,
            require_json: false,
            ingress_response: IngressResponse::default(),
            shutdown_timeout_secs: 10,
            log_json: false,
        }
    }
}

impl RelayConfig {
    /// Defaults merged with an optional TOML file and the environment
    ///
    /// A missing file is not an error.
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load and validate configuration
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(path))
    }

    /// Extract and validate from an already assembled figment
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: RelayConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.dispatch_capacity == 0 {
            return Err(ConfigError::Invalid("dispatch_capacity must be at least 1".into()));
        }
        if self.max_event_bytes == 0 {
            return Err(ConfigError::Invalid("max_event_bytes must be at least 1".into()));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_figment(Figment::from(Serialized::defaults(
            RelayConfig::default(),
        )))
        .unwrap();

        assert_eq!(config.port, 9700);
        assert_eq!(config.relay_mode, RelayMode::Echo);
        assert_eq!(config.overflow_policy, OverflowPolicy::Disconnect);
        assert_eq!(config.ingress_response, IngressResponse::Echo);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port = 8080
relay_mode = "broadcast-others"
overflow_policy = "drop-newest"
queue_capacity = 4
ingress_response = "ack"
"#
        )
        .unwrap();

        let figment = Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Toml::file(file.path()));
        let config = RelayConfig::from_figment(figment).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.relay_mode, RelayMode::BroadcastOthers);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.ingress_response, IngressResponse::Ack);
        // Untouched keys keep their defaults
        assert_eq!(config.dispatch_capacity, 1024);
    }

    #[test]
    fn test_missing_file_is_fine() {
        let figment = Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Toml::file("/nonexistent/relay.toml"));
        assert!(RelayConfig::from_figment(figment).is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let figment = Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Toml::string("queue_capacity = 0"));
        let err = RelayConfig::from_figment(figment).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let figment = Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Toml::string(r#"relay_mode = "shout""#));
        assert!(matches!(
            RelayConfig::from_figment(figment),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn test_env_overrides_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "relay.toml",
                r#"
port = 8080
relay_mode = "broadcast"
queue_capacity = 4
"#,
            )?;
            jail.set_env("RELAY_PORT", "9191");
            jail.set_env("RELAY_OVERFLOW_POLICY", "drop-newest");
            jail.set_env("RELAY_REQUIRE_JSON", "true");

            let config = RelayConfig::load("relay.toml").map_err(|e| e.to_string())?;

            assert_eq!(config.port, 9191);
            assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
            assert!(config.require_json);
            // Keys the environment leaves alone still come from the file
            assert_eq!(config.relay_mode, RelayMode::Broadcast);
            assert_eq!(config.queue_capacity, 4);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_env_value_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("RELAY_QUEUE_CAPACITY", "0");

            let err = RelayConfig::load("relay.toml").unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)));
            Ok(())
        });
    }
}
