//! Single-writer actor owning one room.
//!
//! Every mutation of a room goes through one task: keystrokes, joins and
//! leaves from connected clients, ticks from the room's own timers, and events
//! published by other observers on the room topic. Local and remote events go
//! through the same [`RaceReplica`] merge, so the actor converges with every
//! other observer that saw the same events.
//!
//! Persistence and broadcast are fire-and-forget. Records are handed to a
//! flush task over an unbounded channel; a failing store is logged and the race
//! carries on. When the broadcast link drops the view is marked stale, local
//! typing keeps working, and on reconnection the actor re-reads the participant
//! table from the store and merges it as absolute snapshots.

use crate::bus::{Connectivity, Envelope, ObserverId, Subscription, Transport};
use crate::store::RaceStore;
use crate::timers::{Clock, TimerId, TimerManager};
use log::{debug, info, trace, warn};
use shared::metrics;
use shared::{
    Counters, Keystroke, KeystrokeOutcome, Participant, ParticipantId, RaceError, RaceEvent,
    RaceReplica, Room, RoomCode, RoomId, RoomSnapshot, RoomStatus, TypingCursor, COUNTDOWN_TICKS,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub const MAILBOX_CAPACITY: usize = 256;
pub const EVENT_CAPACITY: usize = 256;

/// How long `Close` waits for queued writes before abandoning them.
const FLUSH_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Called once per participant when their finish is accepted.
pub type FinishHook = Arc<dyn Fn(&Participant) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct JoinAccepted {
    pub participant_id: ParticipantId,
    pub snapshot: RoomSnapshot,
}

pub enum RoomCommand {
    Join {
        display_name: String,
        reply: oneshot::Sender<Result<JoinAccepted, RaceError>>,
    },
    Leave {
        participant_id: ParticipantId,
        reply: oneshot::Sender<Result<(), RaceError>>,
    },
    StartCountdown {
        requested_by: ParticipantId,
        reply: oneshot::Sender<Result<(), RaceError>>,
    },
    Keystroke {
        participant_id: ParticipantId,
        key: Keystroke,
        reply: oneshot::Sender<Result<Counters, RaceError>>,
    },
    CountdownTick {
        remaining: u8,
    },
    RaceTimeout,
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct ActorOptions {
    pub countdown_interval: Duration,
    /// `None` means a race only ends when every active participant finished.
    pub race_timeout: Option<Duration>,
    pub clock: Clock,
    pub finish_hook: Option<FinishHook>,
}

impl Default for ActorOptions {
    fn default() -> Self {
        Self {
            countdown_interval: Duration::from_secs(1),
            race_timeout: None,
            clock: Clock::system(),
            finish_hook: None,
        }
    }
}

enum FlushJob {
    Room(Room),
    Participant(Participant),
}

async fn run_flush<S: RaceStore>(store: Arc<S>, mut jobs: mpsc::UnboundedReceiver<FlushJob>) {
    while let Some(job) = jobs.recv().await {
        let (what, result) = match job {
            FlushJob::Room(room) => (format!("room {}", room.code), store.update_room(room).await),
            FlushJob::Participant(p) => (
                format!("participant {}", p.id),
                store.upsert_participant(p).await,
            ),
        };
        match result {
            Ok(()) => trace!("Persisted {}", what),
            Err(e) => warn!("Failed to persist {}: {}", what, RaceError::from(e)),
        }
    }
}

/// Cheap cloneable front of a running room actor.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    code: RoomCode,
    room_id: RoomId,
    commands: mpsc::Sender<RoomCommand>,
    events: broadcast::Sender<RaceEvent>,
}

impl RoomHandle {
    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Every event the actor accepts, local or remote, in acceptance order.
    pub fn subscribe(&self) -> broadcast::Receiver<RaceEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RaceError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| RaceError::RoomClosed)?;
        response.await.map_err(|_| RaceError::RoomClosed)
    }

    pub async fn join(&self, display_name: impl Into<String>) -> Result<JoinAccepted, RaceError> {
        let display_name = display_name.into();
        self.request(|reply| RoomCommand::Join {
            display_name,
            reply,
        })
        .await?
    }

    pub async fn leave(&self, participant_id: ParticipantId) -> Result<(), RaceError> {
        self.request(|reply| RoomCommand::Leave {
            participant_id,
            reply,
        })
        .await?
    }

    pub async fn start_countdown(&self, requested_by: ParticipantId) -> Result<(), RaceError> {
        self.request(|reply| RoomCommand::StartCountdown {
            requested_by,
            reply,
        })
        .await?
    }

    /// Applies one keystroke and returns the participant's counters afterwards.
    pub async fn keystroke(
        &self,
        participant_id: ParticipantId,
        key: Keystroke,
    ) -> Result<Counters, RaceError> {
        self.request(|reply| RoomCommand::Keystroke {
            participant_id,
            key,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, RaceError> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    /// Cancels timers, drains pending writes and unsubscribes.
    pub async fn close(&self) -> Result<(), RaceError> {
        self.request(|reply| RoomCommand::Close { reply }).await
    }
}

pub struct RoomActor<S: RaceStore> {
    room: Room,
    replica: RaceReplica,
    cursors: HashMap<ParticipantId, TypingCursor>,
    next_participant_id: u32,
    notified: HashSet<ParticipantId>,

    origin: ObserverId,
    topic: String,
    transport: Arc<dyn Transport>,
    subscription: Option<Subscription>,
    connectivity: watch::Receiver<Connectivity>,
    watching_connectivity: bool,

    store: Arc<S>,
    flush_tx: Option<mpsc::UnboundedSender<FlushJob>>,
    flush_task: JoinHandle<()>,

    commands: mpsc::Receiver<RoomCommand>,
    events: broadcast::Sender<RaceEvent>,
    timers: TimerManager,
    options: ActorOptions,
}

impl<S: RaceStore> RoomActor<S> {
    /// Starts an actor for `room`, seeded with the participants read from the store.
    pub fn spawn(
        room: Room,
        participants: Vec<Participant>,
        store: Arc<S>,
        transport: Arc<dyn Transport>,
        options: ActorOptions,
    ) -> RoomHandle {
        let (commands_tx, commands_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let flush_task = tokio::spawn(run_flush(Arc::clone(&store), flush_rx));

        let topic = room.code.topic();
        let subscription = transport.subscribe(&topic);
        let connectivity = transport.connectivity();

        let mut replica = RaceReplica::for_room(&room);
        for record in &participants {
            replica.merge_record(record);
        }
        replica.set_stale(*connectivity.borrow() == Connectivity::Disconnected);

        // Cursors are transient; only a room that has not started can hand out fresh ones.
        let cursors = if room.status() <= RoomStatus::Countdown {
            replica
                .participants()
                .filter(|p| p.active && !p.is_finished())
                .map(|p| (p.id, TypingCursor::new(&room.text)))
                .collect()
        } else {
            HashMap::new()
        };

        let handle = RoomHandle {
            code: room.code.clone(),
            room_id: room.id,
            commands: commands_tx.clone(),
            events: events_tx.clone(),
        };

        let mut actor = RoomActor {
            next_participant_id: participants.iter().map(|p| p.id.0).max().unwrap_or(0),
            notified: participants
                .iter()
                .filter(|p| p.is_finished())
                .map(|p| p.id)
                .collect(),
            room,
            replica,
            cursors,
            origin: rand::random(),
            topic,
            transport,
            subscription: Some(subscription),
            connectivity,
            watching_connectivity: true,
            store,
            flush_tx: Some(flush_tx),
            flush_task,
            commands: commands_rx,
            events: events_tx,
            timers: TimerManager::new(commands_tx),
            options,
        };
        actor.resume_timers();

        tokio::spawn(actor.run());
        handle
    }

    fn resume_timers(&mut self) {
        match self.room.status() {
            RoomStatus::Countdown => self
                .timers
                .start_countdown(COUNTDOWN_TICKS, self.options.countdown_interval),
            RoomStatus::Racing => self.arm_race_timeout(),
            RoomStatus::Waiting | RoomStatus::Finished => {}
        }
    }

    fn arm_race_timeout(&mut self) {
        if let Some(after) = self.options.race_timeout {
            self.timers.start_race_timeout(after);
        }
    }

    async fn run(mut self) {
        info!(
            "Room {} open: {} ({} participants)",
            self.room.code,
            self.room.status(),
            self.replica.len()
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(RoomCommand::Close { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },

                received = next_remote(&mut self.subscription) => {
                    self.handle_remote(received).await;
                },

                changed = self.connectivity.changed(), if self.watching_connectivity => {
                    match changed {
                        Ok(()) => {
                            let status = *self.connectivity.borrow_and_update();
                            self.handle_connectivity(status).await;
                        }
                        Err(_) => {
                            warn!("Room {}: connectivity signal gone", self.room.code);
                            self.watching_connectivity = false;
                            self.replica.set_stale(true);
                        }
                    }
                },
            }
        }

        info!("Room {} closed", self.room.code);
    }

    fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join {
                display_name,
                reply,
            } => {
                let _ = reply.send(self.join(display_name));
            }
            RoomCommand::Leave {
                participant_id,
                reply,
            } => {
                let _ = reply.send(self.leave(participant_id));
            }
            RoomCommand::StartCountdown {
                requested_by,
                reply,
            } => {
                let _ = reply.send(self.start_countdown(requested_by));
            }
            RoomCommand::Keystroke {
                participant_id,
                key,
                reply,
            } => {
                let _ = reply.send(self.keystroke(participant_id, key));
            }
            RoomCommand::CountdownTick { remaining } => self.countdown_tick(remaining),
            RoomCommand::RaceTimeout => {
                if self.room.status() == RoomStatus::Racing {
                    info!("Room {}: race timed out", self.room.code);
                    self.finish_race();
                }
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop.
            RoomCommand::Close { .. } => {}
        }
    }

    fn now(&self) -> u64 {
        self.options.clock.now_ms()
    }

    fn snapshot(&self) -> RoomSnapshot {
        self.replica.snapshot(&self.room)
    }

    fn join(&mut self, display_name: String) -> Result<JoinAccepted, RaceError> {
        if self.room.status() != RoomStatus::Waiting {
            return Err(RaceError::InvalidState {
                status: self.room.status(),
                action: "join",
            });
        }
        if self.replica.active_count() >= self.room.capacity as usize {
            return Err(RaceError::RoomFull {
                capacity: self.room.capacity,
            });
        }

        self.next_participant_id += 1;
        let participant_id = ParticipantId(self.next_participant_id);
        let display_name = match display_name.trim() {
            "" => format!("Racer {}", participant_id),
            name => name.to_string(),
        };

        if self.room.assign_starter(participant_id) {
            debug!("Room {}: participant {} is the starter", self.room.code, participant_id);
            self.flush(FlushJob::Room(self.room.clone()));
        }

        info!("Room {}: {} joined as {}", self.room.code, display_name, participant_id);
        self.publish_local(RaceEvent::ParticipantJoined {
            participant_id,
            display_name,
            joined_at: self.now(),
        });
        self.cursors
            .insert(participant_id, TypingCursor::new(&self.room.text));

        Ok(JoinAccepted {
            participant_id,
            snapshot: self.snapshot(),
        })
    }

    fn leave(&mut self, participant_id: ParticipantId) -> Result<(), RaceError> {
        match self.replica.participant(participant_id) {
            Some(p) if p.active => {}
            _ => return Err(RaceError::UnknownParticipant(participant_id)),
        }

        info!("Room {}: participant {} left", self.room.code, participant_id);
        self.cursors.remove(&participant_id);
        self.publish_local(RaceEvent::ParticipantLeft { participant_id });

        if self.room.status() == RoomStatus::Waiting && self.room.is_starter(participant_id) {
            // Earliest remaining joiner takes over, or the next one to join.
            let next = self
                .replica
                .participants()
                .find(|p| p.active)
                .map(|p| p.id);
            self.room.hand_over_starter(next)?;
            match next {
                Some(id) => debug!("Room {}: participant {} is the starter", self.room.code, id),
                None => debug!("Room {}: starter role is open", self.room.code),
            }
            self.flush(FlushJob::Room(self.room.clone()));
        }
        Ok(())
    }

    fn start_countdown(&mut self, requested_by: ParticipantId) -> Result<(), RaceError> {
        let started = self.room.begin_countdown(requested_by, self.now())?;

        info!("Room {}: countdown started by {}", self.room.code, requested_by);
        self.publish_local(started);
        self.publish_local(RaceEvent::CountdownTick {
            remaining: COUNTDOWN_TICKS,
        });
        self.timers
            .start_countdown(COUNTDOWN_TICKS, self.options.countdown_interval);
        Ok(())
    }

    fn countdown_tick(&mut self, remaining: u8) {
        if self.room.status() != RoomStatus::Countdown {
            debug!(
                "Room {}: ignoring countdown tick {} while {}",
                self.room.code,
                remaining,
                self.room.status()
            );
            return;
        }

        if remaining > 0 {
            self.publish_local(RaceEvent::CountdownTick { remaining });
            return;
        }

        match self.room.start_race(self.now()) {
            Ok(started) => {
                info!("Room {}: race started", self.room.code);
                self.publish_local(RaceEvent::CountdownTick { remaining: 0 });
                self.publish_local(started);
                self.arm_race_timeout();
            }
            Err(e) => debug!("Room {}: {}", self.room.code, e),
        }
    }

    fn keystroke(
        &mut self,
        participant_id: ParticipantId,
        key: Keystroke,
    ) -> Result<Counters, RaceError> {
        if self.room.status() != RoomStatus::Racing {
            return Err(RaceError::InvalidState {
                status: self.room.status(),
                action: "type",
            });
        }

        let cursor = self
            .cursors
            .get_mut(&participant_id)
            .ok_or(RaceError::UnknownParticipant(participant_id))?;

        match cursor.apply(&self.room.text, key) {
            KeystrokeOutcome::Rejected => Err(RaceError::AlreadyFinished(participant_id)),
            KeystrokeOutcome::Unchanged(counters) => Ok(counters),
            KeystrokeOutcome::Progress(counters) => {
                self.publish_local(RaceEvent::progress(participant_id, &counters));
                Ok(counters)
            }
            KeystrokeOutcome::Completed(counters) => {
                self.publish_local(RaceEvent::progress(participant_id, &counters));
                self.record_finish(participant_id, &counters);
                Ok(counters)
            }
        }
    }

    /// Scores a completed cursor against the broadcast start time.
    fn record_finish(&mut self, participant_id: ParticipantId, counters: &Counters) {
        let finished_at = self.now();
        let started_at = self.room.started_at().unwrap_or(finished_at);
        let elapsed = metrics::elapsed_seconds(started_at, finished_at);

        let wpm = metrics::wpm(counters.correct_chars, elapsed);
        let accuracy = metrics::accuracy(counters.correct_chars, counters.total_chars_typed);
        info!(
            "Room {}: participant {} finished, {:.2} wpm, {:.2}% accuracy",
            self.room.code, participant_id, wpm, accuracy
        );

        self.publish_local(RaceEvent::ParticipantFinished {
            participant_id,
            wpm,
            accuracy,
            finished_at,
        });
    }

    fn finish_race(&mut self) {
        match self.room.finish(self.now()) {
            Ok(finished) => {
                self.timers.cancel(TimerId::RaceTimeout);
                self.publish_local(finished);
                if let Some(winner) = self.replica.leaderboard().winner() {
                    info!(
                        "Room {}: race finished, winner {} at {:.2} wpm",
                        self.room.code, winner.display_name, winner.wpm
                    );
                }
            }
            Err(e) => debug!("Room {}: {}", self.room.code, e),
        }
    }

    /// Merges an event and reports whether it changed the replica.
    fn merge(&mut self, event: &RaceEvent) -> Result<bool, RaceError> {
        let before_participant = event
            .participant_id()
            .and_then(|id| self.replica.participant(id).cloned());
        let before_view = *self.replica.view();

        self.replica.apply(event)?;

        let changed = match event.participant_id() {
            Some(id) => self.replica.participant(id) != before_participant.as_ref(),
            None => *self.replica.view() != before_view,
        };
        Ok(changed)
    }

    /// Applies a locally produced event, then broadcasts and persists it.
    fn publish_local(&mut self, event: RaceEvent) {
        if let Err(e) = self.merge(&event) {
            debug!("Room {}: local {} not applied: {}", self.room.code, event.kind(), e);
            return;
        }

        let envelope = Envelope {
            origin: self.origin,
            event: event.clone(),
        };
        if let Err(e) = self.transport.publish(&self.topic, envelope) {
            if !self.replica.is_stale() {
                warn!("Room {}: broadcast failed ({}), view is stale", self.room.code, e);
            }
            self.replica.set_stale(true);
        }

        match event.participant_id() {
            Some(id) => {
                if let Some(record) = self.replica.participant(id) {
                    self.flush(FlushJob::Participant(record.clone()));
                }
            }
            None if matches!(event, RaceEvent::CountdownTick { .. }) => {}
            None => self.flush(FlushJob::Room(self.room.clone())),
        }

        self.after_accept(&event);
    }

    /// Applies an event published by another observer.
    fn accept_remote(&mut self, event: RaceEvent) {
        match self.merge(&event) {
            Ok(true) => {}
            Ok(false) => {
                trace!("Room {}: duplicate {}", self.room.code, event.kind());
                return;
            }
            Err(_) => return,
        }

        match event {
            RaceEvent::CountdownStarted { .. } | RaceEvent::CountdownTick { .. } => {
                self.room.adopt(RoomStatus::Countdown, None, None);
            }
            RaceEvent::RaceStarted { started_at } => {
                let was_racing = self.room.status() >= RoomStatus::Racing;
                self.room.adopt(RoomStatus::Racing, Some(started_at), None);
                if !was_racing {
                    self.arm_race_timeout();
                }
            }
            RaceEvent::RaceFinished { finished_at } => {
                self.room
                    .adopt(RoomStatus::Finished, None, Some(finished_at));
                self.timers.cancel(TimerId::RaceTimeout);
            }
            _ => {}
        }

        self.after_accept(&event);
    }

    fn after_accept(&mut self, event: &RaceEvent) {
        // No receivers just means nobody is watching this room right now.
        let _ = self.events.send(event.clone());

        match event {
            RaceEvent::ParticipantFinished { participant_id, .. } => {
                self.notify_finish(*participant_id);
                self.check_race_complete();
            }
            RaceEvent::ParticipantLeft { .. } => self.check_race_complete(),
            _ => {}
        }
    }

    fn notify_finish(&mut self, participant_id: ParticipantId) {
        if !self.notified.insert(participant_id) {
            return;
        }
        if let (Some(hook), Some(participant)) = (
            self.options.finish_hook.as_ref(),
            self.replica.participant(participant_id),
        ) {
            hook(participant);
        }
    }

    fn check_race_complete(&mut self) {
        if self.room.status() == RoomStatus::Racing && self.replica.all_active_finished() {
            self.finish_race();
        }
    }

    fn flush(&self, job: FlushJob) {
        if let Some(tx) = &self.flush_tx {
            if tx.send(job).is_err() {
                warn!("Room {}: flush task is gone, write dropped", self.room.code);
            }
        }
    }

    async fn handle_remote(&mut self, received: Result<Envelope, RaceError>) {
        match received {
            Ok(envelope) if envelope.origin == self.origin => {}
            Ok(envelope) => self.accept_remote(envelope.event),
            Err(e) => {
                warn!("Room {}: subscription interrupted ({})", self.room.code, e);
                self.replica.set_stale(true);
                self.subscription = Some(self.transport.subscribe(&self.topic));
                if *self.connectivity.borrow() == Connectivity::Connected {
                    self.resync().await;
                }
            }
        }
    }

    async fn handle_connectivity(&mut self, status: Connectivity) {
        match status {
            Connectivity::Disconnected => {
                warn!("Room {}: broadcast link down, view is stale", self.room.code);
                self.replica.set_stale(true);
            }
            Connectivity::Connected => {
                info!("Room {}: broadcast link restored, resyncing", self.room.code);
                self.resync().await;
            }
        }
    }

    /// Re-reads the room and its participants from the store and merges them.
    ///
    /// The view stays stale if the store cannot be read.
    async fn resync(&mut self) {
        let records = match self.store.participants(self.room.id).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Room {}: resync failed: {}", self.room.code, RaceError::from(e));
                return;
            }
        };
        let stored_room = match self.store.room(self.room.id).await {
            Ok(room) => room,
            Err(e) => {
                warn!("Room {}: resync failed: {}", self.room.code, RaceError::from(e));
                return;
            }
        };

        if let Some(stored) = stored_room {
            if let Some(started_at) = stored.started_at() {
                self.accept_remote(RaceEvent::RaceStarted { started_at });
            }
            if let Some(finished_at) = stored.finished_at() {
                self.accept_remote(RaceEvent::RaceFinished { finished_at });
            }
        }

        let count = records.len();
        for record in records {
            for event in record.to_events() {
                self.accept_remote(event);
            }
        }

        self.replica.set_stale(false);
        debug!("Room {}: resynced {} participant records", self.room.code, count);
    }

    async fn shutdown(&mut self) {
        self.timers.cancel_all();
        self.subscription = None;
        self.flush_tx = None;

        if tokio::time::timeout(FLUSH_DRAIN_TIMEOUT, &mut self.flush_task)
            .await
            .is_err()
        {
            warn!("Room {}: pending writes abandoned on close", self.room.code);
            self.flush_task.abort();
        }
    }
}

async fn next_remote(subscription: &mut Option<Subscription>) -> Result<Envelope, RaceError> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
