//! Connected client tracking and keystroke sequencing for the race server
//!
//! This module handles the server-side bookkeeping for every UDP peer:
//! - Client connection lifecycle (connect, disconnect, timeout)
//! - Which room and participant a client is currently racing as
//! - Reordering of sequenced keystrokes that arrive out of order or twice
//!
//! Keystrokes are only handed to a room in strict sequence order. A typing
//! cursor is order-sensitive (a backspace means something different before and
//! after the character it erases), so a gap holds back everything behind it
//! until the client resends the missing packet.

use log::{debug, info};
use shared::{Counters, Keystroke, ParticipantId, RoomCode};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Out-of-order keystrokes buffered per client; beyond this the highest are dropped.
pub const MAX_PENDING_INPUTS: usize = 256;

pub type ClientId = u32;

/// The room a client joined and the participant it races as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub room_code: RoomCode,
    pub participant_id: ParticipantId,
}

/// What happened to a keystroke handed to [`Client::add_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    /// Buffered; may be ready immediately if it is the next in sequence.
    Queued,
    /// Already processed or already buffered. The client should be re-acked.
    Duplicate,
    /// Buffer full of lower sequences; the client will resend.
    Dropped,
}

/// Represents a connected client and its keystroke stream
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: ClientId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Set once the client has joined a room
    pub session: Option<Session>,
    /// Highest keystroke sequence applied to the room
    pub last_processed_input: u32,
    /// Counters returned by the room for `last_processed_input`
    pub last_counters: Counters,
    /// Keystrokes waiting for the gap in front of them to close
    pub pending_inputs: BTreeMap<u32, Keystroke>,
}

impl Client {
    pub fn new(id: ClientId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            session: None,
            last_processed_input: 0,
            last_counters: Counters::default(),
            pending_inputs: BTreeMap::new(),
        }
    }

    /// Buffers a keystroke by sequence number
    ///
    /// Sequences restart at 1 for every room the client joins.
    pub fn add_input(&mut self, sequence: u32, key: Keystroke) -> InputStatus {
        self.last_seen = Instant::now();

        if sequence <= self.last_processed_input || self.pending_inputs.contains_key(&sequence) {
            return InputStatus::Duplicate;
        }
        if self.pending_inputs.len() >= MAX_PENDING_INPUTS {
            // Lower sequences are needed first; the one closing the gap always gets in.
            match self.pending_inputs.last_key_value() {
                Some((&highest, _)) if sequence < highest => {
                    debug!(
                        "Client {} input buffer full, evicting {} for {}",
                        self.id, highest, sequence
                    );
                    self.pending_inputs.remove(&highest);
                }
                _ => return InputStatus::Dropped,
            }
        }

        self.pending_inputs.insert(sequence, key);
        InputStatus::Queued
    }

    /// Takes the next keystroke if it directly follows the last processed one
    pub fn next_ready(&mut self) -> Option<(u32, Keystroke)> {
        let next = self.last_processed_input + 1;
        self.pending_inputs.remove(&next).map(|key| (next, key))
    }

    /// Records the room's answer for `sequence`, applied or rejected
    pub fn mark_processed(&mut self, sequence: u32, counters: Option<Counters>) {
        self.last_processed_input = self.last_processed_input.max(sequence);
        if let Some(counters) = counters {
            self.last_counters = counters;
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    fn reset_inputs(&mut self) {
        self.last_processed_input = 0;
        self.last_counters = Counters::default();
        self.pending_inputs.clear();
    }
}

/// Manages all connected clients
///
/// Enforces the server-wide capacity limit and routes room events to the
/// addresses of the clients racing in that room.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<ClientId, Client>,
    /// Next available client ID for new connections
    next_client_id: ClientId,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns None if the server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<ClientId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));

        Some(client_id)
    }

    /// Removes a client, returning it so its session can be cleaned up
    pub fn remove_client(&mut self, client_id: &ClientId) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        info!("Client {} disconnected", client.id);
        Some(client)
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&client_id)
    }

    /// Refreshes the client's activity timestamp
    pub fn touch(&mut self, client_id: ClientId) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Binds the client to a room participant and restarts its sequence numbers
    pub fn attach(&mut self, client_id: ClientId, session: Session) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                debug!(
                    "Client {} racing as {} in {}",
                    client_id, session.participant_id, session.room_code
                );
                client.session = Some(session);
                client.reset_inputs();
                true
            }
            None => false,
        }
    }

    pub fn detach(&mut self, client_id: ClientId) -> Option<Session> {
        let client = self.clients.get_mut(&client_id)?;
        client.reset_inputs();
        client.session.take()
    }

    pub fn session(&self, client_id: ClientId) -> Option<&Session> {
        self.clients.get(&client_id)?.session.as_ref()
    }

    /// Buffers a keystroke for the client. None if the client is unknown.
    pub fn add_input(
        &mut self,
        client_id: ClientId,
        sequence: u32,
        key: Keystroke,
    ) -> Option<InputStatus> {
        self.clients
            .get_mut(&client_id)
            .map(|client| client.add_input(sequence, key))
    }

    /// Removes and returns every client silent for longer than `timeout`
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Client> {
        let timed_out: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .iter()
            .filter_map(|client_id| self.remove_client(client_id))
            .collect()
    }

    pub fn client_addrs(&self) -> Vec<(ClientId, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    /// Addresses of every client racing in `room_code`
    pub fn client_addrs_in_room(&self, room_code: &RoomCode) -> Vec<(ClientId, SocketAddr)> {
        self.clients
            .iter()
            .filter(|(_, client)| {
                matches!(&client.session, Some(session) if &session.room_code == room_code)
            })
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
