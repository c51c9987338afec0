//! # Cluster Configuration
//!
//! Configuration for the audit/recovery node: identity, gossip, audit
//! deadlines, and election tuning. Loadable from TOML.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NodeConfig {
    /// Worker identifier, used by the broker's ID generator
    pub id: u64,

    /// Hostname this node tags its messages with
    #[validate(length(min = 1, max = 255))]
    pub hostname: String,

    /// Version string advertised to peers
    pub version: String,

    /// TCP port advertised to peers
    pub tcp_port: u16,

    /// HTTP port advertised to peers
    pub http_port: u16,

    /// Optional HTTPS port advertised to peers
    pub https_port: Option<u16>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            hostname: default_hostname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tcp_port: 4150,
            http_port: 4151,
            https_port: None,
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Gossip layer configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GossipConfig {
    /// Local bind address for the gossip protocol (`host:port`)
    #[validate(length(min = 1))]
    pub address: String,

    /// Address advertised to peers
    #[validate(length(min = 1))]
    pub broadcast_address: String,

    /// Bootstrap contacts (`host:port`)
    pub seed_addresses: Vec<String>,

    /// Re-gossip cadence in milliseconds
    #[validate(range(min = 100))]
    pub regossip_interval_ms: u64,

    /// Heartbeat cadence in milliseconds
    #[validate(range(min = 10))]
    pub heartbeat_interval_ms: u64,

    /// Silence interval after which a member is considered failed, in
    /// milliseconds
    #[validate(range(min = 50))]
    pub failure_timeout_ms: u64,

    /// Back-off between seed join attempts, in milliseconds
    #[validate(range(min = 100))]
    pub join_retry_interval_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:4160".to_string(),
            broadcast_address: "127.0.0.1".to_string(),
            seed_addresses: Vec::new(),
            regossip_interval_ms: 60_000,
            heartbeat_interval_ms: 500,
            failure_timeout_ms: 5_000,
            join_retry_interval_ms: 15_000,
        }
    }
}

impl GossipConfig {
    /// Re-gossip cadence
    pub fn regossip_interval(&self) -> Duration {
        Duration::from_millis(self.regossip_interval_ms)
    }

    /// Heartbeat cadence
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Failure detection timeout
    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.failure_timeout_ms)
    }

    /// Seed join back-off
    pub fn join_retry_interval(&self) -> Duration {
        Duration::from_millis(self.join_retry_interval_ms)
    }
}

/// Audit deadline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AuditConfig {
    /// Audit deadline per message, in milliseconds
    #[validate(range(min = 100))]
    pub expiration_time_ms: u64,

    /// Expiry wheel quantum, in milliseconds
    #[validate(range(min = 50))]
    pub wheel_quantum_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { expiration_time_ms: 30_000, wheel_quantum_ms: 2_000 }
    }
}

impl AuditConfig {
    /// Audit deadline per message
    pub fn expiration_time(&self) -> Duration {
        Duration::from_millis(self.expiration_time_ms)
    }

    /// Expiry wheel quantum
    pub fn wheel_quantum(&self) -> Duration {
        Duration::from_millis(self.wheel_quantum_ms)
    }
}

/// Election tuning
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ElectionConfig {
    /// Time to wait for a majority before the election errors, in
    /// milliseconds
    #[validate(range(min = 50))]
    pub timeout_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self { timeout_ms: 2_000 }
    }
}

impl ElectionConfig {
    /// Election completion timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Node identity
    #[validate(nested)]
    pub node: NodeConfig,

    /// Gossip layer
    #[validate(nested)]
    pub gossip: GossipConfig,

    /// Audit deadlines
    #[validate(nested)]
    pub audit: AuditConfig,

    /// Election tuning
    #[validate(nested)]
    pub election: ElectionConfig,
}

impl Config {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    /// Returns an error if parsing or validation fails.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate_config()?;
        Ok(config)
    }

    /// The node name advertised to the cluster: `broadcast-addr:tcp-port`.
    pub fn node_name(&self) -> String {
        format!("{}:{}", self.gossip.broadcast_address, self.node.tcp_port)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error describing the first invalid field.
    pub fn validate_config(&self) -> Result<()> {
        self.validate()?;

        if self.audit.expiration_time_ms < self.audit.wheel_quantum_ms {
            return Err(Error::Configuration(
                "Audit expiration time must be at least one wheel quantum".to_string(),
            ));
        }
        if self.gossip.failure_timeout_ms <= self.gossip.heartbeat_interval_ms {
            return Err(Error::Configuration(
                "Failure timeout must exceed the heartbeat interval".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`]
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the worker ID
    #[must_use]
    pub fn id(mut self, id: u64) -> Self {
        self.config.node.id = id;
        self
    }

    /// Set the hostname
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.node.hostname = hostname.into();
        self
    }

    /// Set the advertised TCP port
    #[must_use]
    pub fn tcp_port(mut self, port: u16) -> Self {
        self.config.node.tcp_port = port;
        self
    }

    /// Set the advertised HTTP port
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.node.http_port = port;
        self
    }

    /// Set the gossip bind address
    #[must_use]
    pub fn gossip_address(mut self, address: impl Into<String>) -> Self {
        self.config.gossip.address = address.into();
        self
    }

    /// Set the address advertised to peers
    #[must_use]
    pub fn broadcast_address(mut self, address: impl Into<String>) -> Self {
        self.config.gossip.broadcast_address = address.into();
        self
    }

    /// Add a seed address
    #[must_use]
    pub fn seed_address(mut self, address: impl Into<String>) -> Self {
        self.config.gossip.seed_addresses.push(address.into());
        self
    }

    /// Set the re-gossip interval
    #[must_use]
    pub fn regossip_interval(mut self, interval: Duration) -> Self {
        self.config.gossip.regossip_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the heartbeat interval
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.gossip.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the failure detection timeout
    #[must_use]
    pub fn failure_timeout(mut self, timeout: Duration) -> Self {
        self.config.gossip.failure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the seed join back-off
    #[must_use]
    pub fn join_retry_interval(mut self, interval: Duration) -> Self {
        self.config.gossip.join_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the audit expiration time
    #[must_use]
    pub fn expiration_time(mut self, expiration: Duration) -> Self {
        self.config.audit.expiration_time_ms = expiration.as_millis() as u64;
        self
    }

    /// Set the expiry wheel quantum
    #[must_use]
    pub fn wheel_quantum(mut self, quantum: Duration) -> Self {
        self.config.audit.wheel_quantum_ms = quantum.as_millis() as u64;
        self
    }

    /// Set the election timeout
    #[must_use]
    pub fn election_timeout(mut self, timeout: Duration) -> Self {
        self.config.election.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    /// Returns an error if the assembled configuration is invalid.
    pub fn build(self) -> Result<Config> {
        self.config.validate_config()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate_config().unwrap();
    }

    #[test]
    fn test_builder() {
        let config = Config::builder()
            .id(3)
            .hostname("node-3")
            .gossip_address("127.0.0.1:0")
            .broadcast_address("127.0.0.1")
            .tcp_port(4150)
            .expiration_time(Duration::from_secs(10))
            .build()
            .unwrap();

        assert_eq!(config.node.id, 3);
        assert_eq!(config.node_name(), "127.0.0.1:4150");
        assert_eq!(config.audit.expiration_time(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_toml() {
        let text = r#"
            [node]
            id = 7
            hostname = "worker-7"
            version = "1.0.0"
            tcp_port = 4150
            http_port = 4151

            [gossip]
            address = "127.0.0.1:4160"
            broadcast_address = "10.0.0.7"
            seed_addresses = ["10.0.0.1:4160"]
            regossip_interval_ms = 60000
            heartbeat_interval_ms = 500
            failure_timeout_ms = 5000
            join_retry_interval_ms = 15000

            [audit]
            expiration_time_ms = 30000
            wheel_quantum_ms = 2000

            [election]
            timeout_ms = 2000
        "#;

        let config = Config::from_toml(text).unwrap();
        assert_eq!(config.node.hostname, "worker-7");
        assert_eq!(config.node_name(), "10.0.0.7:4150");
        assert_eq!(config.gossip.seed_addresses, vec!["10.0.0.1:4160".to_string()]);
    }

    #[test]
    fn test_rejects_expiration_below_quantum() {
        let result = Config::builder()
            .expiration_time(Duration::from_millis(500))
            .wheel_quantum(Duration::from_secs(2))
            .build();
        assert!(result.is_err());
    }
}
