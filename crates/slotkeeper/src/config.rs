//! Server configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration:
//!
//! ```toml
//! [server]
//! ws_bind = "0.0.0.0:8080"
//! http_bind = "0.0.0.0:8081"
//! trust_forwarded_headers = true  # only behind a proxy that sets them
//!
//! [queue]
//! max_size = 10
//! require_invite = true
//!
//! [session]
//! duration_secs = 3600
//! enabled_platforms = ["jira"]
//!
//! [store]
//! redis_url = "redis://127.0.0.1:6379"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slotkeeper_limit::RateLimitConfig;
use slotkeeper_orchestrator::{ContainerConfig, OrchestratorConfig, parse_platforms};
use slotkeeper_transport::ForwardedHeaders;

use crate::SlotkeeperError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub session: SessionConfig,
    pub container: ContainerSection,
    pub rate_limit: RateLimitSection,
    pub store: StoreConfig,
}

/// Listener addresses and per-connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ws_bind: String,
    pub http_bind: String,
    /// A connection that sends nothing for this long is closed.
    pub idle_timeout_secs: u64,
    /// A peer that has not finished the WebSocket upgrade by then is dropped.
    pub handshake_timeout_secs: u64,
    /// Key rate limits on `X-Forwarded-For`/`X-Real-IP` instead of the
    /// socket address.
    pub trust_forwarded_headers: bool,
    pub cookie_name: String,
    /// Mark the session cookie `Secure`. Turn off only for plain-HTTP
    /// development.
    pub cookie_secure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_bind: "0.0.0.0:8080".to_string(),
            http_bind: "0.0.0.0:8081".to_string(),
            idle_timeout_secs: 60,
            handshake_timeout_secs: 10,
            trust_forwarded_headers: false,
            cookie_name: "slotkeeper_session".to_string(),
            cookie_secure: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    pub average_session_minutes: u64,
    pub require_invite: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            average_session_minutes: 60,
            require_invite: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub duration_secs: u64,
    pub warning_before_secs: u64,
    pub hard_timeout_grace_secs: u64,
    pub reconnect_grace_secs: u64,
    pub terminal_url: String,
    /// Platform names, or `all`.
    pub enabled_platforms: Vec<String>,
    pub audit_retention_days: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: 3600,
            warning_before_secs: 300,
            hard_timeout_grace_secs: 60,
            reconnect_grace_secs: 60,
            terminal_url: "/terminal/".to_string(),
            enabled_platforms: vec!["confluence".into(), "jira".into(), "splunk".into()],
            audit_retention_days: 30,
        }
    }
}

/// The `[container]` table; mirrors [`ContainerConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSection {
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
    pub network: Option<String>,
    pub docker_binary: String,
    pub stop_timeout_secs: u64,
}

impl Default for ContainerSection {
    fn default() -> Self {
        let c = ContainerConfig::default();
        Self {
            image: c.image,
            memory: c.memory,
            cpus: c.cpus,
            pids_limit: c.pids_limit,
            network: c.network,
            docker_binary: c.docker_binary,
            stop_timeout_secs: c.stop_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub connections: RateLimitConfig,
    pub invite_failures: RateLimitConfig,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            connections: RateLimitConfig::connections(),
            invite_failures: RateLimitConfig::invite_failures(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL. Without one, records live in process memory
    /// and are lost on restart.
    pub redis_url: Option<String>,
}

impl Config {
    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SlotkeeperError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SlotkeeperError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SlotkeeperError> {
        toml::from_str(content).map_err(|e| SlotkeeperError::Config(e.to_string()))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.server.handshake_timeout_secs)
    }

    pub fn forwarded_headers(&self) -> ForwardedHeaders {
        ForwardedHeaders::from_trust(self.server.trust_forwarded_headers)
    }

    /// The orchestrator's view of this configuration.
    ///
    /// # Errors
    /// [`SlotkeeperError::Config`] for an unknown platform name or a
    /// warning that would fire before the session starts.
    pub fn orchestrator(&self) -> Result<OrchestratorConfig, SlotkeeperError> {
        let s = &self.session;
        if s.warning_before_secs >= s.duration_secs {
            return Err(SlotkeeperError::Config(format!(
                "session.warning_before_secs ({}) must be less than session.duration_secs ({})",
                s.warning_before_secs, s.duration_secs
            )));
        }
        let platforms = parse_platforms(&s.enabled_platforms)
            .map_err(|e| SlotkeeperError::Config(e.to_string()))?;

        Ok(OrchestratorConfig {
            max_queue: self.queue.max_size,
            average_session_minutes: self.queue.average_session_minutes,
            require_invite: self.queue.require_invite,
            session_duration: Duration::from_secs(s.duration_secs),
            warning_before: Duration::from_secs(s.warning_before_secs),
            hard_timeout_grace: Duration::from_secs(s.hard_timeout_grace_secs),
            reconnect_grace: Duration::from_secs(s.reconnect_grace_secs),
            terminal_url: s.terminal_url.clone(),
            platforms,
            audit_retention: Duration::from_secs(s.audit_retention_days * 24 * 60 * 60),
            connection_limit: self.rate_limit.connections.clone(),
            invite_limit: self.rate_limit.invite_failures.clone(),
            ..OrchestratorConfig::default()
        })
    }

    pub fn container(&self) -> ContainerConfig {
        let c = &self.container;
        ContainerConfig {
            image: c.image.clone(),
            memory: c.memory.clone(),
            cpus: c.cpus.clone(),
            pids_limit: c.pids_limit,
            network: c.network.clone(),
            docker_binary: c.docker_binary.clone(),
            stop_timeout_secs: c.stop_timeout_secs,
        }
    }
}
