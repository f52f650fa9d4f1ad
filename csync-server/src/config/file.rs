//! TOML file configuration structures.
//!
//! These structs directly map to the `csync-config.toml` file format. Every
//! section is optional; broker values may also come from the environment.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    pub dead_letter: Option<DeadLetterConfig>,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

/// Broker connection and topology section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat_secs: u16,
    pub connect_timeout_ms: u64,
    /// Shown in the broker's management UI. Defaults to `csync-<role>`.
    pub connection_name: Option<String>,
    pub exchange: String,
    /// Work queue of the consuming service; also the routing key.
    pub queue: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "admin".to_string(),
            password: "admin".to_string(),
            vhost: "/".to_string(),
            heartbeat_secs: 30,
            connect_timeout_ms: 10_000,
            connection_name: None,
            exchange: "user_order".to_string(),
            queue: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerConfig {
    pub prefetch: u16,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub requeue_delay_ms: u64,
    /// How long shutdown waits for the consumer to stop.
    pub shutdown_grace_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            requeue_delay_ms: 1_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublisherMode {
    PerCall,
    Pooled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherConfig {
    pub mode: PublisherMode,
    pub timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            mode: PublisherMode::Pooled,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadLetterConfig {
    pub queue: String,
    pub max_attempts: u32,
}
