//! Orchestrator configuration.

use std::time::Duration;

use slotkeeper_limit::RateLimitConfig;

use crate::Platform;

/// Settings for queue admission and the session lifecycle.
///
/// Every field has a production default; tests usually start from
/// `OrchestratorConfig::default()` and shorten the timers.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum queue length, departed entries included.
    pub max_queue: usize,
    /// Minutes per queue position in the wait estimate.
    pub average_session_minutes: u64,
    /// Refuse `join_queue` without an invite token.
    pub require_invite: bool,

    /// How long a session runs before it is ended with `timeout`.
    pub session_duration: Duration,
    /// How long before expiry the owner is warned.
    pub warning_before: Duration,
    /// Extra time after `session_duration` before the process is killed
    /// outright.
    pub hard_timeout_grace: Duration,
    /// How long a disconnected owner has to come back.
    pub reconnect_grace: Duration,

    /// Where the browser finds the terminal once the session starts.
    pub terminal_url: String,
    /// Platforms whose credentials every session receives.
    pub platforms: Vec<Platform>,
    /// How long invite usage history is kept after the invite expires.
    pub audit_retention: Duration,
    /// Lifetime of the `session:<clientId>` record after teardown.
    pub ended_snapshot_ttl: Duration,

    pub connection_limit: RateLimitConfig,
    pub invite_limit: RateLimitConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_queue: 10,
            average_session_minutes: 60,
            require_invite: false,
            session_duration: Duration::from_secs(60 * 60),
            warning_before: Duration::from_secs(5 * 60),
            hard_timeout_grace: Duration::from_secs(60),
            reconnect_grace: Duration::from_secs(60),
            terminal_url: "/terminal/".to_string(),
            platforms: Platform::ALL.to_vec(),
            audit_retention: Duration::from_secs(30 * 24 * 60 * 60),
            ended_snapshot_ttl: Duration::from_secs(300),
            connection_limit: RateLimitConfig::connections(),
            invite_limit: RateLimitConfig::invite_failures(),
        }
    }
}

impl OrchestratorConfig {
    /// Platform names as sent to clients.
    pub fn platform_names(&self) -> Vec<String> {
        self.platforms.iter().map(|p| p.as_str().to_string()).collect()
    }

    /// Queue wait estimate in minutes for a 1-based position.
    pub fn estimated_wait(&self, position: usize) -> u64 {
        position as u64 * self.average_session_minutes
    }
}
