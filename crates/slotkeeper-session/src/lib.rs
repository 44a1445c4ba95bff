//! Shared state for slotkeeper.
//!
//! This crate holds everything the orchestrator needs to remember between
//! events:
//!
//! 1. **Clients**: who is connected, from where, and in what state
//!    ([`Client`], [`ClientState`])
//! 2. **The queue**: FIFO order of waiting clients, bounded in length
//! 3. **The slot**: idle, starting, active, or ending ([`Slot`]), and the one
//!    [`ActiveSession`] it may hold
//! 4. **Credentials**: session tokens issued at join (pending) and promoted
//!    at session start (active)
//! 5. **The reconnection lock** ([`ReconnectLock`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Orchestrator (above)  ← owns one SharedState behind a mutex
//!     ↕
//! Session Layer (this crate)  ← bookkeeping only, no I/O
//!     ↕
//! Protocol Layer (below)  ← ClientId, SessionId, ServerMessage
//! ```

mod active;
mod client;
mod error;
mod lock;
mod state;

pub use active::{ActiveSession, Slot};
pub use client::{Client, ClientState};
pub use error::StateError;
pub use lock::{ReconnectGuard, ReconnectLock};
pub use state::SharedState;
