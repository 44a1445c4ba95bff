//! Default post-session reclamation.

use slotkeeper_protocol::{EndReason, SessionId};

use crate::PlatformReclaimer;

/// Logs each reclamation request and does nothing else.
///
/// Deployments that seed sandboxes with per-session content swap in a
/// reclaimer that calls their cleanup tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReclaimer;

impl PlatformReclaimer for LoggingReclaimer {
    fn reclaim(&self, platform: &str, session: SessionId, reason: EndReason) {
        tracing::info!(platform, %session, %reason, "platform cleanup requested");
    }
}
