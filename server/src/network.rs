//! Server network layer handling UDP communications and room routing
//!
//! One receiver task decodes datagrams, one sender task writes them, and one
//! checker task drops silent clients. The main loop owns packet handling and
//! talks to room actors through the [`RoomRegistry`]. For every open room a
//! forwarder task relays accepted race events to the clients racing there.

use crate::client_manager::{Client, ClientId, ClientManager, InputStatus, Session};
use crate::config::ServerConfig;
use crate::registry::RoomRegistry;
use crate::room_actor::RoomHandle;
use crate::store::RaceStore;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Keystroke, Packet, RaceError, RoomCode, CLIENT_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Largest UDP payload; snapshots carry the full race text.
pub const MAX_PACKET_SIZE: usize = 65_507;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

pub type ServerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { client: Client },
    Shutdown,
}

/// Messages sent from the main loop and forwarders to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastRoom {
        room_code: RoomCode,
        packet: Packet,
    },
}

/// Stops a running [`Server`] from another task.
#[derive(Clone)]
pub struct ServerHandle {
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        let _ = self.server_tx.send(ServerMessage::Shutdown);
    }
}

/// Main server coordinating networking and room actors
pub struct Server<S: RaceStore> {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    registry: Arc<RoomRegistry<S>>,
    client_timeout: Duration,
    forwarders: HashMap<RoomCode, JoinHandle<()>>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl<S: RaceStore> Server<S> {
    pub async fn new(config: &ServerConfig, registry: Arc<RoomRegistry<S>>) -> ServerResult<Self> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            registry,
            client_timeout: config.client_timeout,
            forwarders: HashMap::new(),
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            server_tx: self.server_tx.clone(),
        }
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[..len]) {
                        Ok(packet) => {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to deserialize packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) -> Option<JoinHandle<()>> {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut outbound_rx = self.outbound_rx.take()?;

        Some(tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::BroadcastRoom { room_code, packet } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.client_addrs_in_room(&room_code)
                        };

                        for (client_id, addr) in client_addrs {
                            if let Err(e) = send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        }))
    }

    /// Spawns task that monitors client timeouts
    fn spawn_timeout_checker(&self) -> JoinHandle<()> {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let timeout = self.client_timeout;

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts(timeout)
                };

                for client in timed_out {
                    info!("Client {} timed out", client.id);
                    if server_tx
                        .send(ServerMessage::ClientTimeout { client })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        })
    }

    /// Relays every event a room accepts to the clients racing in it.
    fn ensure_forwarder(&mut self, handle: &RoomHandle) {
        if let Some(task) = self.forwarders.get(handle.code()) {
            if !task.is_finished() {
                return;
            }
        }

        let room_code = handle.code().clone();
        let mut events = handle.subscribe();
        let outbound_tx = self.outbound_tx.clone();

        let task = tokio::spawn({
            let room_code = room_code.clone();
            async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            let message = OutboundMessage::BroadcastRoom {
                                room_code: room_code.clone(),
                                packet: Packet::Event(event),
                            };
                            if outbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Forwarder for {} lagged, {} events skipped", room_code, missed);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                debug!("Forwarder for {} stopped", room_code);
            }
        });
        self.forwarders.insert(room_code, task);
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self
            .outbound_tx
            .send(OutboundMessage::SendPacket { packet, addr })
        {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn reject(&self, error: &RaceError, addr: SocketAddr) {
        debug!("Rejecting request from {}: {}", addr, error);
        self.send_packet(
            Packet::Rejected {
                reason: error.to_string(),
            },
            addr,
        );
    }

    async fn client_id(&self, addr: SocketAddr) -> Option<ClientId> {
        self.clients.read().await.find_client_by_addr(addr)
    }

    /// The room handle and participant a known client is racing as.
    async fn session(&self, addr: SocketAddr) -> Option<(ClientId, Session, RoomHandle)> {
        let (client_id, session) = {
            let mut clients = self.clients.write().await;
            let client_id = clients.find_client_by_addr(addr)?;
            clients.touch(client_id);
            (client_id, clients.session(client_id)?.clone())
        };
        let handle = self.registry.get(&session.room_code).await?;
        Some((client_id, session, handle))
    }

    /// Processes one incoming packet
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::CreateRoom { text, capacity } => {
                if let Some(client_id) = self.client_id(addr).await {
                    self.clients.write().await.touch(client_id);
                }
                match self.registry.create_room(&text, capacity).await {
                    Ok(room) => self.send_packet(
                        Packet::RoomCreated {
                            room_code: room.code,
                        },
                        addr,
                    ),
                    Err(e) => self.reject(&e, addr),
                }
            }

            Packet::Join {
                client_version,
                room_code,
                display_name,
            } => {
                self.handle_join(client_version, room_code, display_name, addr)
                    .await
            }

            Packet::StartRace => match self.session(addr).await {
                Some((_, session, handle)) => {
                    if let Err(e) = handle.start_countdown(session.participant_id).await {
                        self.reject(&e, addr);
                    }
                }
                None => debug!("StartRace from {} without a session", addr),
            },

            Packet::Keystroke { sequence, key } => self.handle_keystroke(sequence, key, addr).await,

            Packet::Leave => {
                if let Some(client_id) = self.client_id(addr).await {
                    let removed = self.clients.write().await.remove_client(&client_id);
                    if let Some(client) = removed {
                        self.leave_room(client.session).await;
                    }
                }
            }

            Packet::Heartbeat => {
                if let Some(client_id) = self.client_id(addr).await {
                    self.clients.write().await.touch(client_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn handle_join(
        &mut self,
        client_version: u32,
        room_code: RoomCode,
        display_name: String,
        addr: SocketAddr,
    ) {
        info!(
            "Client joining {} from {} (version: {})",
            room_code, addr, client_version
        );

        if client_version != CLIENT_VERSION {
            self.send_packet(
                Packet::Disconnected {
                    reason: "Protocol version mismatch".to_string(),
                },
                addr,
            );
            return;
        }

        if let Err(e) = RoomCode::parse(room_code.as_str()) {
            self.reject(&e, addr);
            return;
        }

        // A client switching rooms leaves the old one first.
        let existing = self.client_id(addr).await;
        let client_id = match existing {
            Some(client_id) => {
                let previous = self.clients.write().await.detach(client_id);
                self.leave_room(previous).await;
                client_id
            }
            None => match self.clients.write().await.add_client(addr) {
                Some(client_id) => client_id,
                None => {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Server full".to_string(),
                        },
                        addr,
                    );
                    return;
                }
            },
        };

        let handle = match self.registry.open(&room_code).await {
            Ok(handle) => handle,
            Err(e) => {
                self.reject(&e, addr);
                return;
            }
        };
        self.ensure_forwarder(&handle);

        match handle.join(display_name).await {
            Ok(accepted) => {
                self.clients.write().await.attach(
                    client_id,
                    Session {
                        room_code: handle.code().clone(),
                        participant_id: accepted.participant_id,
                    },
                );
                self.send_packet(
                    Packet::Joined {
                        participant_id: accepted.participant_id,
                        snapshot: accepted.snapshot,
                    },
                    addr,
                );
            }
            Err(e) => self.reject(&e, addr),
        }
    }

    /// Buffers a keystroke and feeds every keystroke now in sequence to the room.
    async fn handle_keystroke(&mut self, sequence: u32, key: Keystroke, addr: SocketAddr) {
        let Some((client_id, session, handle)) = self.session(addr).await else {
            debug!("Keystroke from {} without a session", addr);
            return;
        };

        let status = self.clients.write().await.add_input(client_id, sequence, key);
        match status {
            Some(InputStatus::Queued) => {}
            Some(InputStatus::Duplicate) => {
                // The ack was lost; repeat the latest one.
                let ack = self.clients.read().await.get(client_id).map(|c| Packet::Ack {
                    sequence: c.last_processed_input,
                    counters: c.last_counters,
                });
                if let Some(ack) = ack {
                    self.send_packet(ack, addr);
                }
                return;
            }
            Some(InputStatus::Dropped) => {
                warn!("Client {} input buffer full, dropped {}", client_id, sequence);
                return;
            }
            None => return,
        }

        loop {
            let ready = self
                .clients
                .write()
                .await
                .get_mut(client_id)
                .and_then(|client| client.next_ready());
            let Some((sequence, key)) = ready else {
                break;
            };

            let result = handle.keystroke(session.participant_id, key).await;

            let mut clients = self.clients.write().await;
            let Some(client) = clients.get_mut(client_id) else {
                break;
            };
            match result {
                Ok(counters) => {
                    client.mark_processed(sequence, Some(counters));
                    self.send_packet(Packet::Ack { sequence, counters }, addr);
                }
                Err(e) => {
                    client.mark_processed(sequence, None);
                    let counters = client.last_counters;
                    self.reject(&e, addr);
                    self.send_packet(Packet::Ack { sequence, counters }, addr);
                }
            }
        }
    }

    async fn leave_room(&self, session: Option<Session>) {
        let Some(session) = session else {
            return;
        };
        if let Some(handle) = self.registry.get(&session.room_code).await {
            if let Err(e) = handle.leave(session.participant_id).await {
                debug!(
                    "Participant {} could not leave {}: {}",
                    session.participant_id, session.room_code, e
                );
            }
        }
    }

    async fn log_stats(&mut self) {
        self.forwarders.retain(|_, task| !task.is_finished());
        let client_count = self.clients.read().await.len();
        if client_count > 0 {
            debug!(
                "{} clients, {} open rooms, {} forwarders",
                client_count,
                self.registry.len().await,
                self.forwarders.len()
            );
        }
    }

    /// Main server loop
    pub async fn run(&mut self) -> ServerResult<()> {
        let mut tasks = vec![self.spawn_network_receiver(), self.spawn_timeout_checker()];
        tasks.extend(self.spawn_network_sender());

        let mut stats_interval = interval(STATS_INTERVAL);

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client }) => {
                            self.leave_room(client.session).await;
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = stats_interval.tick() => self.log_stats().await,
            }
        }

        for task in tasks.into_iter().chain(self.forwarders.drain().map(|(_, t)| t)) {
            task.abort();
        }
        Ok(())
    }
}

async fn send_packet_impl(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
) -> ServerResult<()> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::config::StorageConfig;
    use crate::room_actor::ActorOptions;
    use crate::store::MemoryStore;
    use shared::{ParticipantId, RaceEvent, RoomStatus};

    fn config(max_clients: usize) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            storage: StorageConfig::Memory,
            max_clients,
            client_timeout: Duration::from_secs(10),
            race_timeout: None,
            countdown_interval: Duration::from_millis(20),
        }
    }

    async fn start_server(max_clients: usize) -> (SocketAddr, ServerHandle) {
        let config = config(max_clients);
        let registry = Arc::new(RoomRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalBus::new()),
            ActorOptions {
                countdown_interval: config.countdown_interval,
                ..ActorOptions::default()
            },
        ));
        let mut server = Server::new(&config, registry).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(async move { server.run().await });
        (addr, handle)
    }

    async fn peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn send(socket: &UdpSocket, server: SocketAddr, packet: &Packet) {
        socket
            .send_to(&serialize(packet).unwrap(), server)
            .await
            .unwrap();
    }

    async fn recv(socket: &UdpSocket) -> Packet {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .expect("no packet within 2s")
            .unwrap();
        deserialize(&buffer[..len]).unwrap()
    }

    /// Skips broadcast events until a packet matching `pred` arrives.
    async fn recv_until(socket: &UdpSocket, pred: impl Fn(&Packet) -> bool) -> Packet {
        loop {
            let packet = recv(socket).await;
            if pred(&packet) {
                return packet;
            }
        }
    }

    async fn create_room(socket: &UdpSocket, server: SocketAddr, text: &str) -> RoomCode {
        send(
            socket,
            server,
            &Packet::CreateRoom {
                text: text.to_string(),
                capacity: 4,
            },
        )
        .await;
        match recv(socket).await {
            Packet::RoomCreated { room_code } => room_code,
            other => panic!("Unexpected packet: {:?}", other),
        }
    }

    fn join(room_code: &RoomCode, name: &str) -> Packet {
        Packet::Join {
            client_version: CLIENT_VERSION,
            room_code: room_code.clone(),
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_join() {
        let (server, _handle) = start_server(4).await;
        let socket = peer().await;

        let code = create_room(&socket, server, "ab cd").await;
        send(&socket, server, &join(&code, "Alice")).await;

        match recv_until(&socket, |p| matches!(p, Packet::Joined { .. })).await {
            Packet::Joined {
                participant_id,
                snapshot,
            } => {
                assert_eq!(participant_id, ParticipantId(1));
                assert_eq!(snapshot.code, code);
                assert_eq!(snapshot.view.status, RoomStatus::Waiting);
                assert_eq!(snapshot.participants[0].display_name, "Alice");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_invalid_room_is_rejected() {
        let (server, _handle) = start_server(4).await;
        let socket = peer().await;

        send(
            &socket,
            server,
            &Packet::CreateRoom {
                text: "  ".to_string(),
                capacity: 4,
            },
        )
        .await;
        assert!(matches!(recv(&socket).await, Packet::Rejected { .. }));

        send(&socket, server, &join(&RoomCode::new("NOPE00"), "Alice")).await;
        match recv(&socket).await {
            Packet::Rejected { reason } => assert!(reason.contains("NOPE00")),
            other => panic!("Unexpected packet: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_room_code_is_rejected() {
        let (server, _handle) = start_server(4).await;
        let socket = peer().await;

        send(&socket, server, &join(&RoomCode::new("../x"), "Alice")).await;
        match recv(&socket).await {
            Packet::Rejected { reason } => assert!(reason.contains("invalid room code")),
            other => panic!("Unexpected packet: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (server, _handle) = start_server(4).await;
        let socket = peer().await;

        send(
            &socket,
            server,
            &Packet::Join {
                client_version: CLIENT_VERSION + 1,
                room_code: RoomCode::new("ABCDEF"),
                display_name: "Old".to_string(),
            },
        )
        .await;
        assert_eq!(
            recv(&socket).await,
            Packet::Disconnected {
                reason: "Protocol version mismatch".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_server_full() {
        let (server, _handle) = start_server(1).await;
        let first = peer().await;
        let second = peer().await;

        let code = create_room(&first, server, "ab cd").await;
        send(&first, server, &join(&code, "A")).await;
        recv_until(&first, |p| matches!(p, Packet::Joined { .. })).await;

        send(&second, server, &join(&code, "B")).await;
        assert_eq!(
            recv(&second).await,
            Packet::Disconnected {
                reason: "Server full".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_keystrokes_are_acked_in_order() {
        let (server, _handle) = start_server(4).await;
        let socket = peer().await;

        let code = create_room(&socket, server, "ab cd").await;
        send(&socket, server, &join(&code, "A")).await;
        recv_until(&socket, |p| matches!(p, Packet::Joined { .. })).await;

        send(&socket, server, &Packet::StartRace).await;
        recv_until(&socket, |p| {
            matches!(p, Packet::Event(RaceEvent::RaceStarted { .. }))
        })
        .await;

        // Sequence 2 arrives first and waits for 1.
        send(
            &socket,
            server,
            &Packet::Keystroke {
                sequence: 2,
                key: Keystroke::Char('b'),
            },
        )
        .await;
        send(
            &socket,
            server,
            &Packet::Keystroke {
                sequence: 1,
                key: Keystroke::Char('a'),
            },
        )
        .await;

        let mut acks = Vec::new();
        while acks.len() < 2 {
            if let Packet::Ack { sequence, counters } =
                recv_until(&socket, |p| matches!(p, Packet::Ack { .. })).await
            {
                acks.push((sequence, counters.correct_chars));
            }
        }
        assert_eq!(acks, vec![(1, 1), (2, 2)]);

        // A retransmitted keystroke is re-acked, not reapplied.
        send(
            &socket,
            server,
            &Packet::Keystroke {
                sequence: 2,
                key: Keystroke::Char('b'),
            },
        )
        .await;
        match recv_until(&socket, |p| matches!(p, Packet::Ack { .. })).await {
            Packet::Ack { sequence, counters } => {
                assert_eq!(sequence, 2);
                assert_eq!(counters.total_chars_typed, 2);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_typing_before_start_is_rejected() {
        let (server, _handle) = start_server(4).await;
        let socket = peer().await;

        let code = create_room(&socket, server, "ab cd").await;
        send(&socket, server, &join(&code, "A")).await;
        recv_until(&socket, |p| matches!(p, Packet::Joined { .. })).await;

        send(
            &socket,
            server,
            &Packet::Keystroke {
                sequence: 1,
                key: Keystroke::Char('a'),
            },
        )
        .await;
        match recv_until(&socket, |p| matches!(p, Packet::Rejected { .. })).await {
            Packet::Rejected { reason } => assert!(reason.contains("waiting")),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_shutdown_handle() {
        let config = config(4);
        let registry = Arc::new(RoomRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalBus::new()),
            ActorOptions::default(),
        ));
        let mut server = Server::new(&config, registry).await.unwrap();
        let handle = server.handle();

        let task = tokio::spawn(async move { server.run().await.is_ok() });
        handle.shutdown();
        assert!(tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap());
    }
}
