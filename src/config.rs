use crate::core::nodes::NodeList;
use crate::core::retry::RetryPolicy;
use crate::error::{Result, SyncError};
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Which relay loops this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    DuplicateNotifications,
    SyncImages,
    Both,
}

impl RunMode {
    pub fn runs_duplicator(self) -> bool {
        matches!(self, RunMode::DuplicateNotifications | RunMode::Both)
    }

    pub fn runs_sync_worker(self) -> bool {
        matches!(self, RunMode::SyncImages | RunMode::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::DuplicateNotifications => "duplicate-notifications",
            RunMode::SyncImages => "sync-images",
            RunMode::Both => "both",
        }
    }
}

/// What the duplicator does with the source message when some node
/// publishes failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutFailurePolicy {
    /// Nack with requeue so the whole fan-out is retried on redelivery.
    Requeue,
    /// Ack anyway; the failed nodes miss this notification.
    Ack,
}

impl std::str::FromStr for FanoutFailurePolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(FanoutFailurePolicy::Requeue),
            "ack" => Ok(FanoutFailurePolicy::Ack),
            other => Err(SyncError::Config(format!(
                "Unknown fan-out failure policy '{other}' (expected 'requeue' or 'ack')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Node settings
    pub api_nodes: NodeList,
    pub hostname: String,
    pub rsync_user: String,
    pub datadir: PathBuf,
    pub sync_log_file: Option<PathBuf>,

    // RabbitMQ settings
    pub rabbitmq_url: Option<String>,
    pub rabbit_host: String,
    pub rabbit_port: u16,
    pub rabbit_use_ssl: bool,
    pub rabbit_userid: String,
    pub rabbit_password: String,
    pub rabbit_virtual_host: String,
    pub exchange: String,
    pub topic: String,
    pub relay_prefix: String,
    pub prefetch_count: u16,

    // Failure handling
    pub publish_max_attempts: u32,
    pub publish_backoff_ms: u64,
    pub fanout_failure_policy: FanoutFailurePolicy,
    pub transfer_max_attempts: u32,
    pub transfer_backoff_ms: u64,
    pub delete_recheck_attempts: u32,
    pub delete_recheck_interval_ms: u64,
    /// Markers not written to for this long are leftovers of a killed copy.
    pub in_flight_marker_max_age_secs: u64,

    // HTTP server settings
    pub http_port: u16,

    // Shutdown settings
    pub shutdown_timeout_secs: u64,
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_nodes = lookup("API_NODES")
            .map(|raw| NodeList::parse(&raw))
            .ok_or_else(|| SyncError::Config("API_NODES is required".to_string()))?;

        let hostname = lookup("NODE_HOSTNAME")
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());

        let fanout_failure_policy = match lookup("FANOUT_FAILURE_POLICY") {
            Some(raw) => raw.parse()?,
            None => FanoutFailurePolicy::Requeue,
        };

        Ok(Config {
            // Node configuration
            api_nodes,
            hostname,
            rsync_user: lookup("RSYNC_USER").unwrap_or_else(|| "glance".to_string()),
            datadir: lookup("FILESYSTEM_STORE_DATADIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/glance/images")),
            sync_log_file: lookup("SYNC_LOG_FILE")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),

            // RabbitMQ configuration
            rabbitmq_url: lookup("RABBITMQ_URL").filter(|u| !u.trim().is_empty()),
            rabbit_host: lookup("RABBIT_HOST").unwrap_or_else(|| "localhost".to_string()),
            rabbit_port: parse_or(lookup("RABBIT_PORT"), 5672),
            rabbit_use_ssl: parse_bool(lookup("RABBIT_USE_SSL"), false),
            rabbit_userid: lookup("RABBIT_USERID").unwrap_or_else(|| "guest".to_string()),
            rabbit_password: lookup("RABBIT_PASSWORD").unwrap_or_else(|| "guest".to_string()),
            rabbit_virtual_host: lookup("RABBIT_VIRTUAL_HOST").unwrap_or_else(|| "/".to_string()),
            exchange: lookup("RABBIT_NOTIFICATION_EXCHANGE")
                .unwrap_or_else(|| "glance".to_string()),
            topic: lookup("RABBIT_NOTIFICATION_TOPIC")
                .unwrap_or_else(|| "notifications".to_string()),
            relay_prefix: lookup("RELAY_PREFIX")
                .unwrap_or_else(|| "glance_image_sync".to_string()),
            prefetch_count: parse_or(lookup("PREFETCH_COUNT"), 1),

            // Failure handling configuration
            publish_max_attempts: parse_or(lookup("PUBLISH_MAX_ATTEMPTS"), 3),
            publish_backoff_ms: parse_or(lookup("PUBLISH_BACKOFF_MS"), 500),
            fanout_failure_policy,
            transfer_max_attempts: parse_or(lookup("TRANSFER_MAX_ATTEMPTS"), 3),
            transfer_backoff_ms: parse_or(lookup("TRANSFER_BACKOFF_MS"), 1000),
            delete_recheck_attempts: parse_or(lookup("DELETE_RECHECK_ATTEMPTS"), 3),
            delete_recheck_interval_ms: parse_or(lookup("DELETE_RECHECK_INTERVAL_MS"), 2000),
            in_flight_marker_max_age_secs: parse_or(lookup("IN_FLIGHT_MARKER_MAX_AGE_SECS"), 900),

            // HTTP server configuration
            http_port: parse_or(lookup("HTTP_PORT"), 8080),

            // Shutdown configuration
            shutdown_timeout_secs: parse_or(lookup("SHUTDOWN_TIMEOUT_SECS"), 30),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_nodes.is_empty() {
            return Err(SyncError::Config(
                "At least one API node is required".to_string(),
            ));
        }

        if self.hostname.trim().is_empty() {
            return Err(SyncError::Config("Hostname must not be empty".to_string()));
        }

        for (name, value) in [
            ("Exchange", &self.exchange),
            ("Topic", &self.topic),
            ("Relay prefix", &self.relay_prefix),
            ("Rsync user", &self.rsync_user),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::Config(format!("{name} must not be empty")));
            }
        }

        if !self.datadir.is_absolute() {
            return Err(SyncError::Config(format!(
                "Image datadir must be an absolute path, got {}",
                self.datadir.display()
            )));
        }

        if self.prefetch_count == 0 {
            return Err(SyncError::Config(
                "Prefetch count must be greater than 0".to_string(),
            ));
        }

        if self.publish_max_attempts == 0 || self.transfer_max_attempts == 0 {
            return Err(SyncError::Config(
                "Retry attempt counts must be greater than 0".to_string(),
            ));
        }

        if self.in_flight_marker_max_age_secs == 0 {
            return Err(SyncError::Config(
                "In-flight marker max age must be greater than 0".to_string(),
            ));
        }

        // HTTP port validation (valid port range: 1-65535)
        if self.http_port == 0 {
            return Err(SyncError::Config(
                "HTTP port must be between 1 and 65535".to_string(),
            ));
        }

        if self.shutdown_timeout_secs == 0 {
            return Err(SyncError::Config(
                "Shutdown timeout must be greater than 0".to_string(),
            ));
        }

        self.broker_uri()?;

        Ok(())
    }

    /// AMQP URI for the broker; `RABBITMQ_URL` wins over the discrete fields.
    pub fn broker_uri(&self) -> Result<AMQPUri> {
        if let Some(url) = &self.rabbitmq_url {
            return url
                .parse::<AMQPUri>()
                .map_err(|e| SyncError::Config(format!("Invalid RABBITMQ_URL: {e}")));
        }

        Ok(AMQPUri {
            scheme: if self.rabbit_use_ssl {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.rabbit_userid.clone(),
                    password: self.rabbit_password.clone(),
                },
                host: self.rabbit_host.clone(),
                port: self.rabbit_port,
            },
            vhost: self.rabbit_virtual_host.clone(),
            ..Default::default()
        })
    }

    pub fn publish_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.publish_max_attempts, self.publish_backoff_ms)
    }

    pub fn transfer_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.transfer_max_attempts, self.transfer_backoff_ms)
    }

    pub fn in_flight_marker_max_age(&self) -> Duration {
        Duration::from_secs(self.in_flight_marker_max_age_secs)
    }

    pub fn delete_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.delete_recheck_interval_ms)
    }
}
