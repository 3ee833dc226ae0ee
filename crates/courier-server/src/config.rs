//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - built-in defaults
//! - the first TOML file found among `courier.toml`,
//!   `/etc/courier/courier.toml` and `~/.config/courier/courier.toml`
//! - environment variables `COURIER__SECTION__FIELD`
//!   (e.g. `COURIER__SESSION__KEEPALIVE_MS=15000`)

use anyhow::{ensure, Context, Result};
use courier_core::{BackplaneConfig, ChatConfig, NotificationConfig, SessionConfig};
use courier_protocol::WireFormat;
use courier_transport::MeshConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
];

const ENV_PREFIX: &str = "COURIER";

/// Longest recall entry lifetime accepted.
const MAX_RECALL_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub chat: ChatSettings,

    #[serde(default)]
    pub notifications: NotificationSettings,

    #[serde(default)]
    pub backplane: BackplaneSettings,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Per-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Deliveries buffered per session before the hub drops.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Idle interval before a keepalive ping, in milliseconds.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,

    /// Largest inbound WebSocket message in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Wire format when the client does not ask for one.
    #[serde(default)]
    pub wire_format: WireFormat,
}

/// Chat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_chat_max_content")]
    pub max_content_length: usize,

    #[serde(default = "default_history_limit")]
    pub default_history_limit: usize,

    #[serde(default = "default_max_history_limit")]
    pub max_history_limit: usize,

    /// Prime joining sessions with the last message of the room.
    #[serde(default = "default_true")]
    pub recall_enabled: bool,

    #[serde(default = "default_recall_ttl_secs")]
    pub recall_ttl_secs: u64,
}

/// Notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default = "default_notification_max_content")]
    pub max_content_length: usize,

    #[serde(default = "default_history_limit")]
    pub default_history_limit: usize,

    #[serde(default = "default_max_history_limit")]
    pub max_history_limit: usize,
}

/// Backplane transport variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process publish/subscribe.
    Bus,
    /// In-process durable queue.
    Queue,
    /// TCP links to peer processes.
    Mesh,
}

/// Cross-process replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneSettings {
    /// Active transports; empty disables replication.
    #[serde(default)]
    pub transports: Vec<TransportKind>,

    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// Address the mesh accepts peer links on.
    #[serde(default)]
    pub mesh_listen: Option<SocketAddr>,

    /// Mesh peers to publish to.
    #[serde(default)]
    pub mesh_peers: Vec<SocketAddr>,

    #[serde(default = "default_reconnect_delay_ms")]
    pub mesh_reconnect_delay_ms: u64,

    #[serde(default = "default_resubscribe_attempts")]
    pub resubscribe_attempts: u32,

    #[serde(default = "default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_keepalive_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_chat_max_content() -> usize {
    4000
}

fn default_notification_max_content() -> usize {
    1000
}

fn default_history_limit() -> usize {
    50
}

fn default_max_history_limit() -> usize {
    100
}

fn default_recall_ttl_secs() -> u64 {
    3600
}

fn default_subject_prefix() -> String {
    "courier".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_resubscribe_attempts() -> u32 {
    5
}

fn default_resubscribe_delay_ms() -> u64 {
    100
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            session: SessionSettings::default(),
            chat: ChatSettings::default(),
            notifications: NotificationSettings::default(),
            backplane: BackplaneSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            keepalive_ms: default_keepalive_ms(),
            max_message_size: default_max_message_size(),
            wire_format: WireFormat::default(),
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_content_length: default_chat_max_content(),
            default_history_limit: default_history_limit(),
            max_history_limit: default_max_history_limit(),
            recall_enabled: true,
            recall_ttl_secs: default_recall_ttl_secs(),
        }
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            max_content_length: default_notification_max_content(),
            default_history_limit: default_history_limit(),
            max_history_limit: default_max_history_limit(),
        }
    }
}

impl Default for BackplaneSettings {
    fn default() -> Self {
        Self {
            transports: Vec::new(),
            subject_prefix: default_subject_prefix(),
            mesh_listen: None,
            mesh_peers: Vec::new(),
            mesh_reconnect_delay_ms: default_reconnect_delay_ms(),
            resubscribe_attempts: default_resubscribe_attempts(),
            resubscribe_delay_ms: default_resubscribe_delay_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file or an override cannot be parsed.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());
        Self::layered(file.as_deref())
    }

    /// Load configuration from a specific file, then the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path = path
            .to_str()
            .with_context(|| format!("Config path is not UTF-8: {}", path.display()))?;
        Self::layered(Some(path))
    }

    fn layered(file: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                ::config::File::new(path, ::config::FileFormat::Toml).required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("backplane.transports")
                .with_list_parse_key("backplane.mesh_peers"),
        );

        let source = file.unwrap_or("defaults");
        let config = builder
            .build()
            .and_then(|layered| layered.try_deserialize::<Self>())
            .with_context(|| format!("Failed to load configuration from {source}"))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {source}"))?;
        Ok(config)
    }

    /// Reject values the delivery core cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.session.keepalive_ms > 0,
            "session.keepalive_ms must be greater than zero"
        );
        ensure!(
            self.chat.recall_ttl_secs > 0 && self.chat.recall_ttl_secs <= MAX_RECALL_TTL_SECS,
            "chat.recall_ttl_secs must be between 1 and {MAX_RECALL_TTL_SECS}"
        );
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            outbound_capacity: self.session.outbound_capacity,
            keepalive: Duration::from_millis(self.session.keepalive_ms),
            ..SessionConfig::default()
        }
    }

    #[must_use]
    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            max_content_length: self.chat.max_content_length,
            default_history_limit: self.chat.default_history_limit,
            max_history_limit: self.chat.max_history_limit,
            recall_enabled: self.chat.recall_enabled,
            recall_ttl: Duration::from_secs(self.chat.recall_ttl_secs),
        }
    }

    #[must_use]
    pub fn notification_config(&self) -> NotificationConfig {
        NotificationConfig {
            max_content_length: self.notifications.max_content_length,
            default_history_limit: self.notifications.default_history_limit,
            max_history_limit: self.notifications.max_history_limit,
        }
    }

    #[must_use]
    pub fn backplane_config(&self) -> BackplaneConfig {
        BackplaneConfig {
            subject_prefix: self.backplane.subject_prefix.clone(),
            resubscribe_attempts: self.backplane.resubscribe_attempts,
            initial_delay: Duration::from_millis(self.backplane.resubscribe_delay_ms),
            ..BackplaneConfig::default()
        }
    }

    #[must_use]
    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            listen: self.backplane.mesh_listen,
            peers: self.backplane.mesh_peers.clone(),
            reconnect_delay: Duration::from_millis(self.backplane.mesh_reconnect_delay_ms),
            ..MeshConfig::default()
        }
    }
}
