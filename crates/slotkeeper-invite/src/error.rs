//! Error types for invite handling.

use slotkeeper_store::StoreError;

/// Errors from reading or writing invite records.
///
/// Validation outcomes (revoked, used, expired...) are not errors; they come
/// back as [`InviteReason`](slotkeeper_protocol::InviteReason)s. These are the
/// cases where the store itself let us down.
#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    /// The store could not be reached or returned garbage.
    #[error("invite store error: {0}")]
    Store(#[from] StoreError),

    /// Usage was recorded against an invite that no longer exists.
    #[error("invite record not found: {0}")]
    NotFound(String),
}
