use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub queue: QueueConfig,
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Pub/Sub channel contract for live notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Per-user channels are `{user_channel_prefix}{identity}`
    pub user_channel_prefix: String,
    /// Single channel carrying admin broadcasts
    pub admin_channel: String,
}

impl RelayConfig {
    /// Pattern covering every per-user channel
    #[must_use]
    pub fn user_channel_pattern(&self) -> String {
        format!("{}*", self.user_channel_prefix)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            user_channel_prefix: "notification:user:".to_string(),
            admin_channel: "notification:admin".to_string(),
        }
    }
}

/// Mail stream consumer-group policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub stream: String,
    pub group: String,
    pub dead_letter_stream: String,
    /// Delivery attempts allowed before an entry is dead-lettered
    pub max_retries: u64,
    /// Entries read per XREADGROUP call
    pub batch_size: usize,
    /// How long a read blocks waiting for new entries
    pub block_seconds: u64,
    /// Pending entries idle at least this long are eligible for reclaim
    pub min_idle_seconds: u64,
    /// Approximate maximum stream length kept after successful sends
    pub trim_max_len: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: "mail_queue".to_string(),
            group: "go-mailer".to_string(),
            dead_letter_stream: "mail_dlq".to_string(),
            max_retries: 5,
            batch_size: 10,
            block_seconds: 5,
            min_idle_seconds: 5,
            trim_max_len: 1000,
        }
    }
}

/// SMTP configuration for outbound mail
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_email: String,
    pub from_name: String,
    pub use_tls: bool,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            from_email: String::new(),
            from_name: "Courier".to_string(),
            use_tls: true,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (COURIER_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("COURIER")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get Redis URL
    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Whether SMTP is configured well enough to attempt sends
    #[must_use]
    pub fn mail_configured(&self) -> bool {
        !self.mail.smtp_host.is_empty() && !self.mail.from_email.is_empty()
    }
}
