//! Configuration module for csync-server.
//!
//! Handles loading configuration from the TOML file, CLI arguments and
//! environment variables, then validates everything before any connection
//! is attempted.

pub mod file;

use crate::config::file::{FileConfig, PublisherMode as FilePublisherMode};
use csync_sdk::config::{
    BrokerConfig, ConfigValueError, ConsumerConfig, DeadLetterPolicy, PublisherConfig,
    PublisherMode, ServerConfig, Topology,
};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(#[from] ConfigValueError),

    #[error("environment variable {name} is invalid: {reason}")]
    InvalidEnv { name: &'static str, reason: String },

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Which side of the pipeline this process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    /// Owns the derived order records and runs the consumer.
    OrderService,
    /// Owns the user records and publishes contact changes.
    UserService,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::OrderService => "order-service",
            Role::UserService => "user-service",
        }
    }
}

/// Validated configuration for one process.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub topology: Topology,
    pub consumer: ConsumerConfig,
    pub publisher: PublisherConfig,
    pub shutdown_grace: Duration,
}

/// Broker settings taken from the environment, named as the services have
/// always been deployed.
const ENV_HOST: &str = "RABBITMQ_HOST";
const ENV_PORT: &str = "RABBITMQ_PORT";
const ENV_USER: &str = "RABBITMQ_USER";
const ENV_PASSWORD: &str = "RABBITMQ_PASSWORD";
const ENV_QUEUE: &str = "RABBITMQ_QUEUE_NAME";
const ENV_EXCHANGE: &str = "RABBITMQ_EXCHANGE";

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: std::path::PathBuf,
    listen_override: Option<SocketAddr>,
    role: Role,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>, role: Role) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
            role,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file, if present
    /// 2. Apply environment and CLI overrides
    /// 3. Validate and build the runtime values
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let file_config = if self.config_path.exists() {
            let config_content = std::fs::read_to_string(&self.config_path)?;
            toml::from_str(&config_content)?
        } else {
            tracing::warn!(
                path = %self.config_path.display(),
                "Config file not found, using defaults and environment"
            );
            FileConfig::default()
        };
        self.load_from(file_config, |name| std::env::var(name).ok())
    }

    fn load_from(
        &self,
        mut file_config: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<LoadedConfig, ConfigError> {
        apply_env_overrides(&mut file_config, env)?;
        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }
        self.build(file_config)
    }

    fn build(&self, file_config: FileConfig) -> Result<LoadedConfig, ConfigError> {
        let broker_section = file_config.broker;
        let broker = BrokerConfig {
            host: broker_section.host,
            port: broker_section.port,
            username: broker_section.username,
            password: broker_section.password,
            vhost: broker_section.vhost,
            heartbeat_secs: broker_section.heartbeat_secs,
            connect_timeout: Duration::from_millis(broker_section.connect_timeout_ms),
            connection_name: broker_section
                .connection_name
                .unwrap_or_else(|| format!("csync-{}", self.role.as_str())),
        };
        broker.validate()?;

        let queue = broker_section.queue.ok_or_else(|| {
            ConfigValueError::new("broker.queue", format!("is required (or set {ENV_QUEUE})"))
        })?;
        let mut topology = Topology::new(broker_section.exchange, queue)?;
        if let Some(dead_letter) = file_config.dead_letter {
            topology = topology.with_dead_letter(DeadLetterPolicy {
                queue: dead_letter.queue,
                max_attempts: dead_letter.max_attempts,
            })?;
        }

        let consumer = ConsumerConfig {
            prefetch: file_config.consumer.prefetch,
            reconnect_initial: Duration::from_millis(file_config.consumer.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(file_config.consumer.reconnect_max_ms),
            requeue_delay: Duration::from_millis(file_config.consumer.requeue_delay_ms),
        };
        consumer.validate()?;

        if file_config.publisher.timeout_ms == 0 {
            return Err(ConfigValueError::new("publisher.timeout_ms", "must be greater than zero").into());
        }
        let publisher = PublisherConfig {
            mode: match file_config.publisher.mode {
                FilePublisherMode::PerCall => PublisherMode::PerCall,
                FilePublisherMode::Pooled => PublisherMode::Pooled,
            },
            timeout: Duration::from_millis(file_config.publisher.timeout_ms),
        };

        Ok(LoadedConfig {
            server: ServerConfig {
                listen: file_config.server.listen,
            },
            broker,
            topology,
            consumer,
            publisher,
            shutdown_grace: Duration::from_millis(file_config.consumer.shutdown_grace_ms),
        })
    }
}

fn apply_env_overrides(
    config: &mut FileConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(host) = env(ENV_HOST) {
        config.broker.host = host;
    }
    if let Some(port) = env(ENV_PORT) {
        config.broker.port = port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            name: ENV_PORT,
            reason: format!("{port:?} is not a port number"),
        })?;
    }
    if let Some(user) = env(ENV_USER) {
        config.broker.username = user;
    }
    if let Some(password) = env(ENV_PASSWORD) {
        config.broker.password = password;
    }
    if let Some(queue) = env(ENV_QUEUE) {
        config.broker.queue = Some(queue);
    }
    if let Some(exchange) = env(ENV_EXCHANGE) {
        config.broker.exchange = exchange;
    }
    Ok(())
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file::DeadLetterConfig;
    use std::collections::HashMap;

    fn loader() -> ConfigLoader {
        ConfigLoader::new("./does-not-matter.toml", None, Role::OrderService)
    }

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = FileConfig::default();
        file.broker.host = "from-file".into();
        let loaded = loader()
            .load_from(
                file,
                env_of(&[
                    ("RABBITMQ_HOST", "rabbitmq"),
                    ("RABBITMQ_PORT", "5673"),
                    ("RABBITMQ_USER", "svc"),
                    ("RABBITMQ_PASSWORD", "pw"),
                    ("RABBITMQ_QUEUE_NAME", "order_service"),
                ]),
            )
            .unwrap();
        assert_eq!(loaded.broker.host, "rabbitmq");
        assert_eq!(loaded.broker.port, 5673);
        assert_eq!(loaded.broker.username, "svc");
        assert_eq!(loaded.broker.connection_name, "csync-order-service");
        assert_eq!(loaded.topology.queue(), "order_service");
        assert_eq!(loaded.topology.routing_key(), "order_service");
        assert_eq!(loaded.topology.exchange(), "user_order");
    }

    #[test]
    fn test_missing_queue_is_fatal() {
        let err = loader()
            .load_from(FileConfig::default(), env_of(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_bad_port_is_fatal() {
        let err = loader()
            .load_from(
                FileConfig::default(),
                env_of(&[("RABBITMQ_PORT", "amqp"), ("RABBITMQ_QUEUE_NAME", "q")]),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        let mut file = FileConfig::default();
        file.broker.queue = Some("q".into());
        file.consumer.prefetch = 0;
        assert!(loader().load_from(file, env_of(&[])).is_err());

        let mut file = FileConfig::default();
        file.broker.queue = Some("q".into());
        file.consumer.prefetch = 4;
        assert!(matches!(
            loader().load_from(file, env_of(&[])),
            Err(ConfigError::ValidationError(_))
        ));

        let mut file = FileConfig::default();
        file.broker.queue = Some("q".into());
        file.dead_letter = Some(DeadLetterConfig {
            queue: "q".into(),
            max_attempts: 3,
        });
        assert!(loader().load_from(file, env_of(&[])).is_err());

        let mut file = FileConfig::default();
        file.broker.queue = Some("q".into());
        file.broker.exchange = String::new();
        assert!(loader().load_from(file, env_of(&[])).is_err());
    }

    #[test]
    fn test_listen_override_wins() {
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let loader = ConfigLoader::new("./x.toml", Some(addr), Role::UserService);
        let mut file = FileConfig::default();
        file.broker.queue = Some("q".into());
        let loaded = loader.load_from(file, env_of(&[])).unwrap();
        assert_eq!(loaded.server.listen, addr);
        assert_eq!(loaded.publisher.mode, PublisherMode::Pooled);
    }
}
