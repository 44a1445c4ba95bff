//! Invite validation and usage accounting.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use slotkeeper_protocol::InviteReason;
use slotkeeper_store::{Store, get_json, invite_key, set_json};
use tracing::Instrument;

use crate::{InviteError, InviteRecord, InviteStatus, UsageEntry};

static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{4,64}$").expect("invite token regex is valid")
});

/// Lower bound for the TTL of a record rewritten as `expired`.
const EXPIRED_TTL_FLOOR: Duration = Duration::from_secs(60);

/// TTL used when an expired record had no TTL of its own.
const EXPIRED_TTL_DEFAULT: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum lifetime of a record after usage is recorded.
const MIN_AUDIT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Returns `true` if `token` has the shape of an invite token.
pub fn is_well_formed(token: &str) -> bool {
    TOKEN_PATTERN.is_match(token)
}

/// The first eight characters of a token, safe to put in logs.
pub fn token_prefix(token: &str) -> String {
    token.chars().take(8).collect()
}

/// A session that currently holds an invite: queued with a pending
/// credential, starting, live, or ending but not yet recorded.
///
/// Every holder counts against its invite's quota, since its use has not
/// reached `useCount` yet. A request from the same address with the same
/// token may re-enter a `rejoinable` holder's session on an exhausted
/// invite. Ending sessions are not rejoinable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteHolder {
    pub ip: String,
    pub invite_token: String,
    pub rejoinable: bool,
}

/// The result of [`InviteValidator::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub valid: bool,
    pub reason: Option<InviteReason>,
    /// The record as read from the store, when one was found and accepted.
    pub record: Option<InviteRecord>,
    /// Accepted only because it belongs to a session the caller already
    /// owns. No new use is implied.
    pub rejoin: bool,
}

impl Validation {
    fn accepted(record: InviteRecord) -> Self {
        Self {
            valid: true,
            reason: None,
            record: Some(record),
            rejoin: false,
        }
    }

    fn rejoined(record: InviteRecord) -> Self {
        Self {
            rejoin: true,
            ..Self::accepted(record)
        }
    }

    fn rejected(reason: InviteReason) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            record: None,
            rejoin: false,
        }
    }

    /// Label used for the span field and the outcome counter.
    pub fn outcome(&self) -> &'static str {
        match (self.valid, self.rejoin, self.reason) {
            (true, true, _) => "rejoin",
            (true, false, _) => "valid",
            (false, _, Some(reason)) => reason.as_str(),
            (false, _, None) => "invalid",
        }
    }
}

/// Running totals kept by one validator.
#[derive(Debug, Default)]
struct Tally {
    valid: AtomicU64,
    rejoined: AtomicU64,
    rejected: AtomicU64,
}

/// A point-in-time copy of a validator's totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidationStats {
    pub valid: u64,
    pub rejoined: u64,
    pub rejected: u64,
}

/// Checks invite tokens against the store and records their use.
///
/// Rate limiting of failed attempts is the caller's job: this type only
/// answers "is this token good right now?".
pub struct InviteValidator<S> {
    store: S,
    tally: Tally,
}

impl<S: Store> InviteValidator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            tally: Tally::default(),
        }
    }

    /// The store records are read from.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Totals since this validator was created.
    pub fn stats(&self) -> ValidationStats {
        ValidationStats {
            valid: self.tally.valid.load(Ordering::Relaxed),
            rejoined: self.tally.rejoined.load(Ordering::Relaxed),
            rejected: self.tally.rejected.load(Ordering::Relaxed),
        }
    }

    /// Validates `token` for a request from `ip`.
    ///
    /// Checks run in order and stop at the first failure:
    ///
    /// 1. shape of the token (never touches the store)
    /// 2. the record exists
    /// 3. status and quota, counting `holders` of the same token as uses
    ///    already spent. An exhausted invite is still accepted if `ip` and
    ///    `token` match a rejoinable holder
    /// 4. expiry, rewriting the record as `expired` when it has lapsed
    pub async fn validate(
        &self,
        token: &str,
        ip: &str,
        holders: &[InviteHolder],
    ) -> Validation {
        let span = tracing::info_span!(
            "invite.validate",
            token_prefix = %token_prefix(token),
            outcome = tracing::field::Empty,
        );
        let result = self
            .run_checks(token, ip, holders)
            .instrument(span.clone())
            .await;

        let outcome = result.outcome();
        span.record("outcome", outcome);
        metrics::counter!("invite_validations_total", "outcome" => outcome).increment(1);
        let slot = match (result.valid, result.rejoin) {
            (true, false) => &self.tally.valid,
            (true, true) => &self.tally.rejoined,
            (false, _) => &self.tally.rejected,
        };
        slot.fetch_add(1, Ordering::Relaxed);

        result
    }

    async fn run_checks(
        &self,
        token: &str,
        ip: &str,
        holders: &[InviteHolder],
    ) -> Validation {
        if !is_well_formed(token) {
            tracing::debug!("malformed invite token");
            return Validation::rejected(InviteReason::Invalid);
        }

        let key = invite_key(token);
        let record: InviteRecord = match get_json(&self.store, &key).await {
            Ok(Some(record)) => record,
            Ok(None) => return Validation::rejected(InviteReason::NotFound),
            Err(e) => {
                tracing::warn!(error = %e, "invite lookup failed");
                return Validation::rejected(InviteReason::Unavailable);
            }
        };

        match record.status {
            InviteStatus::Revoked => return Validation::rejected(InviteReason::Revoked),
            InviteStatus::Expired => return Validation::rejected(InviteReason::Expired),
            _ => {}
        }

        let held: Vec<&InviteHolder> = holders.iter().filter(|h| h.invite_token == token).collect();
        if record.is_exhausted_with(held.len()) {
            if held.iter().any(|h| h.rejoinable && h.ip == ip) {
                tracing::info!(ip, "exhausted invite accepted for rejoin");
                return Validation::rejoined(record);
            }
            tracing::debug!(
                use_count = record.use_count,
                in_flight = held.len(),
                max_uses = record.max_uses,
                "invite quota spent"
            );
            return Validation::rejected(InviteReason::Used);
        }

        if record.is_expired_at(Utc::now()) {
            self.mark_expired(&key, record).await;
            return Validation::rejected(InviteReason::Expired);
        }

        Validation::accepted(record)
    }

    async fn mark_expired(&self, key: &str, mut record: InviteRecord) {
        record.status = InviteStatus::Expired;
        let ttl = match self.store.ttl(key).await {
            Ok(Some(left)) => left.max(EXPIRED_TTL_FLOOR),
            Ok(None) => EXPIRED_TTL_DEFAULT,
            Err(e) => {
                tracing::warn!(error = %e, "could not read invite ttl");
                EXPIRED_TTL_DEFAULT
            }
        };
        if let Err(e) = set_json(&self.store, key, &record, ttl).await {
            tracing::warn!(error = %e, "could not mark invite expired");
        }
    }

    /// Appends `entry` to the invite's history and counts one use.
    ///
    /// The record is kept for `max(1 day, time until expiry + retention)`
    /// so the audit trail outlives the invite itself. Failures are logged
    /// and swallowed: teardown must not wait on bookkeeping.
    pub async fn record_usage(&self, token: &str, entry: UsageEntry, retention: Duration) {
        if let Err(e) = self.try_record_usage(token, entry, retention).await {
            tracing::warn!(
                token_prefix = %token_prefix(token),
                error = %e,
                "failed to record invite usage"
            );
        }
    }

    async fn try_record_usage(
        &self,
        token: &str,
        entry: UsageEntry,
        retention: Duration,
    ) -> Result<(), InviteError> {
        let key = invite_key(token);
        let mut record: InviteRecord = get_json(&self.store, &key)
            .await?
            .ok_or_else(|| InviteError::NotFound(token_prefix(token)))?;

        let session_id = entry.session_id.clone();
        record.push_usage(entry);
        if record.use_count > record.max_uses {
            tracing::warn!(
                token_prefix = %token_prefix(token),
                use_count = record.use_count,
                max_uses = record.max_uses,
                "invite used beyond its quota"
            );
        }

        let until_expiry = record
            .expires_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or_default();
        let ttl = (until_expiry + retention).max(MIN_AUDIT_TTL);

        set_json(&self.store, &key, &record, ttl).await?;
        tracing::info!(
            token_prefix = %token_prefix(token),
            %session_id,
            use_count = record.use_count,
            max_uses = record.max_uses,
            status = ?record.status,
            "invite usage recorded"
        );
        Ok(())
    }
}
