use crate::game::ClientRace;
use crate::input::{spawn_stdin_source, InputManager, TypingBot};
use crate::rendering::{RenderConfig, Renderer};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Keystroke, Packet, RaceEvent, RoomCode, RoomStatus, CLIENT_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const HANDSHAKE_RETRY: Duration = Duration::from_secs(1);

/// Which room to enter.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomTarget {
    Join(RoomCode),
    Create { text: String, capacity: u8 },
}

/// Where keystrokes come from.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    Stdin,
    /// Starts typing once the race starts.
    Bot(TypingBot),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server: String,
    pub display_name: String,
    pub target: RoomTarget,
    pub source: KeySource,
    /// Ask for the countdown once this many participants are present.
    pub start_when: Option<usize>,
    pub resend_timeout: Duration,
    pub fake_ping_ms: u64,
}

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    options: ClientOptions,

    race: ClientRace,
    input_manager: InputManager,
    renderer: Renderer,
    render_config: RenderConfig,

    keys_tx: mpsc::UnboundedSender<Keystroke>,
    keys_rx: mpsc::UnboundedReceiver<Keystroke>,
    source_task: Option<JoinHandle<()>>,

    handshake: Option<Packet>,
    last_handshake: Instant,
    last_sent: Instant,
    start_requested: bool,
    done: bool,
}

impl Client {
    pub async fn new(options: ClientOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = options.server.parse()?;
        let (keys_tx, keys_rx) = mpsc::unbounded_channel();

        Ok(Client {
            socket,
            server_addr,
            render_config: RenderConfig {
                fake_ping_ms: options.fake_ping_ms,
                ..RenderConfig::default()
            },
            options,
            race: ClientRace::new(),
            input_manager: InputManager::new(),
            renderer: Renderer::new(),
            keys_tx,
            keys_rx,
            source_task: None,
            handshake: None,
            last_handshake: Instant::now(),
            last_sent: Instant::now(),
            start_requested: false,
            done: false,
        })
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.options.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.options.fake_ping_ms / 2)).await;
        }

        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn join_packet(&self, room_code: RoomCode) -> Packet {
        Packet::Join {
            client_version: CLIENT_VERSION,
            room_code,
            display_name: self.options.display_name.clone(),
        }
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let packet = match &self.options.target {
            RoomTarget::Join(code) => {
                info!("Joining room {}...", code);
                self.join_packet(code.clone())
            }
            RoomTarget::Create { text, capacity } => {
                info!("Creating a room for {} players...", capacity);
                Packet::CreateRoom {
                    text: text.clone(),
                    capacity: *capacity,
                }
            }
        };
        self.send_handshake(packet).await
    }

    async fn send_handshake(&mut self, packet: Packet) -> Result<(), Box<dyn std::error::Error>> {
        self.send_packet(&packet).await?;
        self.handshake = Some(packet);
        self.last_handshake = Instant::now();
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Box<dyn std::error::Error>> {
        match packet {
            Packet::RoomCreated { room_code } => {
                if matches!(self.handshake, Some(Packet::CreateRoom { .. })) {
                    info!("Created room {}", room_code);
                    let join = self.join_packet(room_code);
                    self.send_handshake(join).await?;
                }
            }

            Packet::Joined {
                participant_id,
                snapshot,
            } => {
                info!(
                    "Joined room {} as participant {}",
                    snapshot.code, participant_id
                );
                self.handshake = None;
                self.race.apply_joined(participant_id, &snapshot);
                self.input_manager.reset();
                if self.options.source == KeySource::Stdin && self.source_task.is_none() {
                    self.source_task = Some(spawn_stdin_source(self.keys_tx.clone()));
                }
                if self.race.status() == RoomStatus::Racing {
                    self.start_bot();
                }
            }

            Packet::Ack { sequence, counters } => {
                if let Some(round_trip) = self.race.apply_ack(sequence, counters) {
                    self.render_config.ping_ms = round_trip.as_millis() as u64;
                }
            }

            Packet::Event(event) => self.handle_event(event),

            Packet::Rejected { reason } => warn!("Server rejected request: {}", reason),

            Packet::Disconnected { reason } => {
                error!("Disconnected: {}", reason);
                self.done = true;
            }

            other => debug!("Unexpected packet from server: {:?}", other),
        }
        Ok(())
    }

    fn handle_event(&mut self, event: RaceEvent) {
        if let Err(e) = self.race.apply_event(&event) {
            debug!("Discarded {} event: {}", event.kind(), e);
            return;
        }

        match event {
            RaceEvent::RaceStarted { .. } => {
                info!("Race started!");
                self.start_bot();
            }
            RaceEvent::ParticipantFinished {
                participant_id,
                wpm,
                accuracy,
                ..
            } if Some(participant_id) == self.race.participant_id() => {
                info!("Finished at {:.2} wpm with {:.2}% accuracy", wpm, accuracy);
            }
            RaceEvent::RaceFinished { .. } => {
                let board = self.race.view().leaderboard;
                match board.winner() {
                    Some(winner) => info!(
                        "Race finished, {} wins at {:.2} wpm",
                        winner.display_name, winner.wpm
                    ),
                    None => info!("Race finished without a winner"),
                }
                self.done = true;
            }
            _ => {}
        }
    }

    fn start_bot(&mut self) {
        let KeySource::Bot(bot) = &self.options.source else {
            return;
        };
        if self.source_task.is_some() {
            return;
        }
        if let Some(room) = self.race.room() {
            self.source_task = Some(bot.clone().spawn(room.text.clone(), self.keys_tx.clone()));
        }
    }

    async fn handle_key(&mut self, key: Keystroke) -> Result<(), Box<dyn std::error::Error>> {
        if self.race.predict(key).is_none() {
            return Ok(());
        }

        let input = self.input_manager.sequence(key);
        self.race.record_pending(input.sequence, input.key, Instant::now());
        self.send_packet(&Packet::Keystroke {
            sequence: input.sequence,
            key: input.key,
        })
        .await
    }

    async fn maintain(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let now = Instant::now();

        if let Some(packet) = self.handshake.clone() {
            if now.duration_since(self.last_handshake) >= HANDSHAKE_RETRY {
                debug!("No reply yet, retrying");
                self.send_handshake(packet).await?;
            }
            return Ok(());
        }

        for (sequence, key) in self.race.due_for_resend(now, self.options.resend_timeout) {
            debug!("Resending keystroke {}", sequence);
            self.send_packet(&Packet::Keystroke { sequence, key }).await?;
        }

        if now.duration_since(self.last_sent) >= HEARTBEAT_INTERVAL {
            self.send_packet(&Packet::Heartbeat).await?;
        }

        self.request_start_if_ready().await
    }

    async fn request_start_if_ready(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let Some(wanted) = self.options.start_when else {
            return Ok(());
        };
        if self.start_requested || self.race.status() != RoomStatus::Waiting {
            return Ok(());
        }
        let present = self.race.replica().map(|r| r.active_count()).unwrap_or(0);
        if present >= wanted {
            info!("{} participants present, starting the countdown", present);
            self.start_requested = true;
            self.send_packet(&Packet::StartRace).await?;
        }
        Ok(())
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut maintenance = interval(Duration::from_millis(50));
        let mut buffer = vec![0u8; 65_536];

        while !self.done {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if self.options.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.options.fake_ping_ms / 2)).await;
                            }

                            match deserialize::<Packet>(&buffer[..len]) {
                                Ok(packet) => self.handle_packet(packet).await?,
                                Err(e) => warn!("Malformed packet from server: {}", e),
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                Some(key) = self.keys_rx.recv() => {
                    if let Err(e) = self.handle_key(key).await {
                        error!("Error sending keystroke: {}", e);
                    }
                },

                _ = maintenance.tick() => {
                    if let Err(e) = self.maintain().await {
                        error!("Error sending packet: {}", e);
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Leaving...");
                    break;
                },
            }

            self.renderer.render(&self.race.view(), &self.render_config);
        }

        if let Some(task) = self.source_task.take() {
            task.abort();
        }
        if self.race.participant_id().is_some() {
            let _ = self.send_packet(&Packet::Leave).await;
        }

        Ok(())
    }
}
