/// Configuration management for esclusa
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main esclusa configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Backend connection pool configuration
    pub pool: PoolSettings,
    /// Replica-set topology tracking configuration
    pub topology: TopologySettings,
    /// Per-session limits
    pub session: SessionSettings,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Maximum number of open backend connections across all members
    pub max_connections: usize,
    /// Number of worker threads
    pub worker_threads: Option<usize>,
}

/// Backend connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum open connections per cluster member
    pub per_member: usize,
    /// How long an acquire may wait before failing, in milliseconds
    pub acquire_timeout_ms: u64,
    /// Backend dial timeout in milliseconds
    pub connect_timeout_ms: u64,
}

/// Replica-set topology tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySettings {
    /// Seed members of the replica set (host:port)
    pub members: Vec<String>,
    /// Probe interval in seconds
    pub probe_interval_sec: u64,
    /// Per-probe timeout in seconds
    pub probe_timeout_sec: u64,
    /// Consecutive failed probe cycles before a member is forgotten
    pub removal_grace_cycles: u32,
}

/// Per-session limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Idle timeout in seconds; silent sessions are closed after this
    pub idle_timeout_sec: u64,
    /// Maximum size of a single wire message in bytes
    pub max_message_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:27111".to_string(),
                max_connections: 64,
                worker_threads: None, // Use system default
            },
            pool: PoolSettings {
                per_member: 8,
                acquire_timeout_ms: 5000,
                connect_timeout_ms: 5000,
            },
            topology: TopologySettings {
                members: vec!["127.0.0.1:27017".to_string()],
                probe_interval_sec: 10,
                probe_timeout_sec: 5,
                removal_grace_cycles: 3,
            },
            session: SessionSettings {
                idle_timeout_sec: 3600,
                max_message_size: crate::protocol::DEFAULT_MAX_MESSAGE_SIZE,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
                stdout: true,
                file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate server config
        if self.server.listen_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "listen_addr cannot be empty".to_string(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        // Validate pool config
        if self.pool.per_member == 0 {
            return Err(ConfigError::ValidationError(
                "pool per_member must be greater than 0".to_string(),
            ));
        }

        if self.pool.acquire_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "acquire_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.pool.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // Validate topology config
        if self.topology.members.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one replica set member is required".to_string(),
            ));
        }

        for member in &self.topology.members {
            if member.trim().is_empty() || !member.contains(':') {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid member address '{}': must be host:port",
                    member
                )));
            }
        }

        if self.topology.probe_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "probe_interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.topology.probe_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "probe_timeout_sec must be greater than 0".to_string(),
            ));
        }

        if self.topology.probe_timeout_sec >= self.topology.probe_interval_sec {
            return Err(ConfigError::ValidationError(
                "probe_timeout_sec must be less than probe_interval_sec".to_string(),
            ));
        }

        if self.topology.removal_grace_cycles == 0 {
            return Err(ConfigError::ValidationError(
                "removal_grace_cycles must be greater than 0".to_string(),
            ));
        }

        // Validate session config
        if self.session.idle_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "idle_timeout_sec must be greater than 0".to_string(),
            ));
        }

        if self.session.max_message_size < crate::protocol::HEADER_LEN {
            return Err(ConfigError::ValidationError(
                "max_message_size is smaller than a message header".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            topology: TopologySettings {
                members: vec![
                    "10.0.1.10:27017".to_string(),
                    "10.0.1.11:27017".to_string(),
                    "10.0.1.12:27017".to_string(),
                ],
                probe_interval_sec: 10,
                probe_timeout_sec: 5,
                removal_grace_cycles: 3,
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
