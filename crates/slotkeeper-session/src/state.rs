//! The shared state: every client, the queue, the slot, and credentials.
//!
//! One `SharedState` is built at startup and handed to the orchestrator,
//! which keeps it behind a single `tokio::sync::Mutex`. Nothing else holds a
//! copy. All methods here are synchronous; the orchestrator decides where
//! the awaits go.
//!
//! # Invariants
//!
//! - a client id appears at most once in the queue
//! - the queue never grows past `max_queue`
//! - at most one [`ActiveSession`], and only inside [`Slot::Active`]
//! - a credential is either pending (mapped to a client) or active (mapped
//!   to a session), never both

use std::collections::{HashMap, VecDeque};

use rand::Rng;
use slotkeeper_protocol::{ClientId, ServerMessage, SessionId};
use tokio::sync::mpsc;

use crate::{ActiveSession, Client, ClientState, Slot, StateError};

/// Process-wide registry of clients, queue, and slot.
///
/// ## Queue entries of departed clients
///
/// A queued client that disconnects is removed from `clients` but its id is
/// left in the queue. The entry still counts toward `max_queue` and toward
/// other clients' positions until promotion reaches it and discards it.
#[derive(Debug)]
pub struct SharedState {
    clients: HashMap<ClientId, Client>,
    queue: VecDeque<ClientId>,
    max_queue: usize,
    /// The slot. Public so the orchestrator can drive phase transitions.
    pub slot: Slot,
    pending: HashMap<String, ClientId>,
    active: HashMap<String, SessionId>,
    next_client: u64,
}

impl SharedState {
    /// Creates an empty state whose queue holds at most `max_queue` entries.
    pub fn new(max_queue: usize) -> Self {
        Self {
            clients: HashMap::new(),
            queue: VecDeque::new(),
            max_queue,
            slot: Slot::Idle,
            pending: HashMap::new(),
            active: HashMap::new(),
            next_client: 1,
        }
    }

    // -- Clients -----------------------------------------------------------

    /// Registers a new connection and returns its id.
    pub fn register(
        &mut self,
        ip: impl Into<String>,
        user_agent: Option<String>,
        outbox: mpsc::UnboundedSender<ServerMessage>,
    ) -> ClientId {
        let id = ClientId(self.next_client);
        self.next_client += 1;
        let client = Client::new(id, ip, user_agent, outbox);
        tracing::debug!(client_id = %id, ip = %client.ip, "client registered");
        self.clients.insert(id, client);
        id
    }

    /// Forgets a client. Its queue entry (if any) stays behind; its pending
    /// credential is dropped.
    pub fn unregister(&mut self, id: ClientId) -> Option<Client> {
        let client = self.clients.remove(&id)?;
        if let Some(token) = &client.credential {
            if self.pending.get(token) == Some(&id) {
                self.pending.remove(token);
            }
        }
        tracing::debug!(client_id = %id, "client unregistered");
        Some(client)
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Sends `msg` to `id` if it is still connected. Returns whether it was
    /// queued for delivery.
    pub fn send_to(&self, id: ClientId, msg: ServerMessage) -> bool {
        self.clients.get(&id).is_some_and(|c| c.send(msg))
    }

    /// Moves a client to `state`.
    pub fn set_state(&mut self, id: ClientId, state: ClientState) -> Result<(), StateError> {
        let client = self
            .clients
            .get_mut(&id)
            .ok_or(StateError::UnknownClient(id))?;
        client.state = state;
        Ok(())
    }

    // -- Queue -------------------------------------------------------------

    /// Appends a client to the queue tail and returns its 1-based position.
    ///
    /// # Errors
    /// - [`StateError::UnknownClient`] if the client is not registered
    /// - [`StateError::AlreadyQueued`] if it is already in the queue
    /// - [`StateError::QueueFull`] if the queue is at capacity
    pub fn enqueue(&mut self, id: ClientId) -> Result<usize, StateError> {
        if !self.clients.contains_key(&id) {
            return Err(StateError::UnknownClient(id));
        }
        if self.queue.contains(&id) {
            return Err(StateError::AlreadyQueued(id));
        }
        if self.queue.len() >= self.max_queue {
            return Err(StateError::QueueFull {
                max: self.max_queue,
            });
        }
        self.queue.push_back(id);
        if let Some(client) = self.clients.get_mut(&id) {
            client.state = ClientState::Queued;
            client.queued_at = Some(tokio::time::Instant::now());
        }
        Ok(self.queue.len())
    }

    /// Removes a client from the queue. Returns `true` if it was there.
    pub fn dequeue(&mut self, id: ClientId) -> bool {
        let Some(index) = self.queue.iter().position(|q| *q == id) else {
            return false;
        };
        self.queue.remove(index);
        if let Some(client) = self.clients.get_mut(&id) {
            if client.state == ClientState::Queued {
                client.state = ClientState::Connected;
            }
        }
        true
    }

    /// Pops the queue head, live or not.
    pub fn pop_head(&mut self) -> Option<ClientId> {
        self.queue.pop_front()
    }

    pub fn is_queued(&self, id: ClientId) -> bool {
        self.queue.contains(&id)
    }

    /// 1-based position of `id`, counting departed entries ahead of it.
    pub fn position(&self, id: ClientId) -> Option<usize> {
        self.queue.iter().position(|q| *q == id).map(|i| i + 1)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    /// `(client, position)` for every queued client still connected, in
    /// queue order.
    pub fn live_positions(&self) -> Vec<(ClientId, usize)> {
        self.queue
            .iter()
            .enumerate()
            .filter(|(_, id)| self.clients.contains_key(id))
            .map(|(i, id)| (*id, i + 1))
            .collect()
    }

    // -- Credentials -------------------------------------------------------

    /// Issues a fresh pending credential to `id`, replacing any pending one
    /// it already held.
    pub fn issue_pending(&mut self, id: ClientId) -> Result<String, StateError> {
        let client = self
            .clients
            .get_mut(&id)
            .ok_or(StateError::UnknownClient(id))?;
        if let Some(old) = client.credential.take() {
            self.pending.remove(&old);
        }
        let token = generate_token();
        client.credential = Some(token.clone());
        self.pending.insert(token.clone(), id);
        Ok(token)
    }

    /// Moves a pending credential to the active set, bound to `session`.
    /// Returns `false` if `token` was not pending.
    pub fn activate_credential(&mut self, token: &str, session: SessionId) -> bool {
        if self.pending.remove(token).is_none() {
            return false;
        }
        self.active.insert(token.to_owned(), session);
        true
    }

    /// Forgets a credential in either set.
    pub fn revoke_credential(&mut self, token: &str) {
        self.pending.remove(token);
        self.active.remove(token);
    }

    /// The client holding `token` as a pending credential.
    pub fn pending_owner(&self, token: &str) -> Option<ClientId> {
        self.pending.get(token).copied()
    }

    /// The session `token` authenticates, if that session is the one in the
    /// slot right now.
    pub fn session_for_credential(&self, token: &str) -> Option<&ActiveSession> {
        let id = self.active.get(token)?;
        self.slot.active().filter(|s| s.session_id == *id)
    }

    /// `true` if the credential is known at all (pending or active).
    pub fn credential_known(&self, token: &str) -> bool {
        self.pending.contains_key(token) || self.active.contains_key(token)
    }
}

/// Generates a random 32-character hex string (128 bits of entropy).
///
/// Used for session credentials: the value a browser trades for its
/// session cookie.
fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// =========================================================================
// Tests
// =========================================================================
