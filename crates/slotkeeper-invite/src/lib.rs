//! Invites for slotkeeper.
//!
//! An invite is a bearer token with a usage quota and an optional expiry,
//! stored as JSON under `invite:<token>`. This crate:
//!
//! 1. **Validates** tokens ([`InviteValidator::validate`]) in a fixed order:
//!    shape, existence, status/quota, expiry.
//! 2. **Counts sessions in flight**: queued, starting, live and ending
//!    sessions on a token are uses already spent, so one invite cannot
//!    admit more clients than its quota.
//! 3. **Honors rejoins**: a client reconnecting to a session it already owns
//!    is let back in on an exhausted invite, since that is not a new use.
//! 4. **Records usage** once per session, at teardown
//!    ([`InviteValidator::record_usage`]).
//!
//! ```text
//! Orchestrator (above)  ← decides who gets in, supplies invite holders
//!     ↕
//! Invite Layer (this crate)
//!     ↕
//! Store (below)  ← `invite:<token>` records with TTLs
//! ```
//!
//! # Concurrency
//!
//! Usage recording is read-modify-write without a compare-and-set. That is
//! only correct while one slotkeeper process writes a given invite.

mod error;
mod record;
mod validator;

pub use error::InviteError;
pub use record::{InviteRecord, InviteStatus, UsageEntry};
pub use validator::{
    InviteHolder, InviteValidator, Validation, ValidationStats, is_well_formed,
    token_prefix,
};
