//! The invite record as stored under `invite:<token>`.
//!
//! Records are created by operator tooling outside this process; field names
//! are camelCase on the wire so both sides read the same JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    #[default]
    Active,
    Used,
    Revoked,
    Expired,
}

/// One past session that consumed this invite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    pub session_id: String,
    pub client_id: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: String,
    /// Time the client spent in the queue before promotion, in milliseconds.
    pub queue_wait_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// A bearer invite with a usage quota and an optional expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRecord {
    pub token: String,
    #[serde(default)]
    pub status: InviteStatus,
    #[serde(default)]
    pub use_count: u32,
    #[serde(default = "default_max_uses")]
    pub max_uses: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Append-only history of sessions run on this invite.
    #[serde(default)]
    pub usages: Vec<UsageEntry>,
}

fn default_max_uses() -> u32 {
    1
}

impl InviteRecord {
    /// A fresh, active, single-use invite with no expiry.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            status: InviteStatus::Active,
            use_count: 0,
            max_uses: default_max_uses(),
            created_at: Some(Utc::now()),
            expires_at: None,
            label: None,
            usages: Vec::new(),
        }
    }

    /// Sets the quota.
    pub fn with_max_uses(mut self, max_uses: u32) -> Self {
        self.max_uses = max_uses;
        self
    }

    /// Sets the expiry.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// `true` once the status or the counter says no uses are left.
    pub fn is_exhausted(&self) -> bool {
        self.is_exhausted_with(0)
    }

    /// Like [`is_exhausted`](Self::is_exhausted), with `in_flight` sessions
    /// on this invite that have not been recorded yet counted as used.
    pub fn is_exhausted_with(&self, in_flight: usize) -> bool {
        let in_flight = u32::try_from(in_flight).unwrap_or(u32::MAX);
        self.status == InviteStatus::Used
            || self.use_count.saturating_add(in_flight) >= self.max_uses
    }

    /// `true` if `expires_at` is set and not after `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Appends a usage and bumps the counter, flipping to `used` at quota.
    ///
    /// Quota is enforced at admission. The counter records what actually
    /// ran, so an overrun shows up here instead of being hidden.
    pub fn push_usage(&mut self, entry: UsageEntry) {
        self.usages.push(entry);
        self.use_count = self.use_count.saturating_add(1);
        if self.use_count >= self.max_uses {
            self.status = InviteStatus::Used;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage() -> UsageEntry {
        let now = Utc::now();
        UsageEntry {
            session_id: "s".into(),
            client_id: 1,
            started_at: now,
            ended_at: now,
            end_reason: "timeout".into(),
            queue_wait_ms: 0,
            ip: None,
            user_agent: None,
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_deserialize_minimal_record_fills_defaults() {
        let record: InviteRecord = serde_json::from_str(r#"{"token":"abcd"}"#).unwrap();

        assert_eq!(record.status, InviteStatus::Active);
        assert_eq!(record.use_count, 0);
        assert_eq!(record.max_uses, 1);
        assert!(record.usages.is_empty());
    }

    #[test]
    fn test_serialize_uses_camel_case_fields() {
        let record = InviteRecord::new("abcd").with_max_uses(3);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["maxUses"], 3);
        assert_eq!(json["useCount"], 0);
        assert_eq!(json["status"], "active");
    }

    #[test]
    fn test_push_usage_flips_to_used_at_quota() {
        let mut record = InviteRecord::new("abcd").with_max_uses(2);

        record.push_usage(usage());
        assert_eq!(record.status, InviteStatus::Active);
        assert!(!record.is_exhausted());

        record.push_usage(usage());
        assert_eq!(record.use_count, 2);
        assert_eq!(record.status, InviteStatus::Used);
        assert!(record.is_exhausted());
    }

    #[test]
    fn test_push_usage_past_quota_counts_every_session() {
        let mut record = InviteRecord::new("abcd");

        record.push_usage(usage());
        record.push_usage(usage());

        assert_eq!(record.use_count, 2);
        assert_eq!(record.usages.len(), 2);
        assert_eq!(record.status, InviteStatus::Used);
    }

    #[test]
    fn test_is_exhausted_with_counts_in_flight_sessions() {
        let record = InviteRecord::new("abcd").with_max_uses(2);

        assert!(!record.is_exhausted_with(1));
        assert!(record.is_exhausted_with(2));
        assert!(!record.is_exhausted());
    }

    #[test]
    fn test_is_expired_at_without_expiry_is_false() {
        assert!(!InviteRecord::new("abcd").is_expired_at(Utc::now()));
    }
}
