//! Client-side race state with prediction and reconciliation
//!
//! The local cursor runs the same typing state machine as the server, so every
//! keystroke is shown immediately. Keystrokes stay in the input history until
//! the server acknowledges them and are resent if an ack does not arrive in
//! time. Everything the server broadcasts goes through the shared replica merge,
//! which discards progress older than what was already predicted.

use log::{debug, warn};
use shared::{
    metrics, timestamp_ms, Counters, Keystroke, KeystrokeOutcome, Leaderboard, ParticipantId,
    PlayerStats, RaceError, RaceEvent, RaceReplica, RaceText, RoomCode, RoomSnapshot, RoomStatus,
    RoomView, TypingCursor,
};
use std::time::Duration;
use tokio::time::Instant;

/// Resends of one keystroke before the view is flagged stale.
pub const STALE_AFTER_RESENDS: u32 = 3;

/// A keystroke sent to the server and not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInput {
    pub sequence: u32,
    pub key: Keystroke,
    pub sent_at: Instant,
    pub resends: u32,
}

/// Static facts about the joined room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub code: RoomCode,
    pub text: RaceText,
    pub capacity: u8,
}

/// Everything the renderer needs for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceView {
    pub room: Option<RoomInfo>,
    pub local_id: Option<ParticipantId>,
    pub view: RoomView,
    pub stale: bool,
    pub leaderboard: Leaderboard,
    pub local_counters: Option<Counters>,
    /// Live speed of the local participant, once the race has started.
    pub local_stats: Option<PlayerStats>,
    pub word_index: usize,
    pub pending_inputs: usize,
}

pub struct ClientRace {
    participant_id: Option<ParticipantId>,
    room: Option<RoomInfo>,
    replica: Option<RaceReplica>,
    cursor: Option<TypingCursor>,
    input_history: Vec<PendingInput>,
    confirmed: Counters,
    divergences: u32,
}

impl ClientRace {
    pub fn new() -> Self {
        Self {
            participant_id: None,
            room: None,
            replica: None,
            cursor: None,
            input_history: Vec::new(),
            confirmed: Counters::default(),
            divergences: 0,
        }
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.participant_id
    }

    pub fn room(&self) -> Option<&RoomInfo> {
        self.room.as_ref()
    }

    pub fn replica(&self) -> Option<&RaceReplica> {
        self.replica.as_ref()
    }

    pub fn status(&self) -> RoomStatus {
        self.replica
            .as_ref()
            .map(|r| r.status())
            .unwrap_or(RoomStatus::Waiting)
    }

    pub fn is_finished(&self) -> bool {
        self.cursor.as_ref().map(|c| c.is_finished()).unwrap_or(false)
    }

    pub fn confirmed(&self) -> Counters {
        self.confirmed
    }

    /// Acks whose counters disagreed with the local prediction.
    pub fn divergences(&self) -> u32 {
        self.divergences
    }

    pub fn pending_inputs(&self) -> &[PendingInput] {
        &self.input_history
    }

    /// Starts over from the server's snapshot of the joined room.
    pub fn apply_joined(&mut self, participant_id: ParticipantId, snapshot: &RoomSnapshot) {
        self.participant_id = Some(participant_id);
        self.room = Some(RoomInfo {
            code: snapshot.code.clone(),
            text: snapshot.text.clone(),
            capacity: snapshot.capacity,
        });
        self.replica = Some(RaceReplica::from_snapshot(snapshot));
        self.cursor = Some(TypingCursor::new(&snapshot.text));
        self.input_history.clear();
        self.confirmed = Counters::default();
    }

    /// Applies a keystroke locally before the server has seen it.
    ///
    /// Returns None when the keystroke must not be sent: the race is not
    /// running, nothing has been joined, or the local cursor already finished.
    pub fn predict(&mut self, key: Keystroke) -> Option<KeystrokeOutcome> {
        if self.status() != RoomStatus::Racing {
            return None;
        }
        let (Some(id), Some(room), Some(cursor)) =
            (self.participant_id, self.room.as_ref(), self.cursor.as_mut())
        else {
            return None;
        };

        let outcome = cursor.apply(&room.text, key);
        match outcome {
            KeystrokeOutcome::Rejected => return None,
            KeystrokeOutcome::Unchanged(_) => {}
            KeystrokeOutcome::Progress(counters) | KeystrokeOutcome::Completed(counters) => {
                if let Some(replica) = self.replica.as_mut() {
                    let _ = replica.apply(&RaceEvent::progress(id, &counters));
                }
            }
        }
        Some(outcome)
    }

    /// Remembers a sent keystroke until it is acknowledged.
    pub fn record_pending(&mut self, sequence: u32, key: Keystroke, now: Instant) {
        self.input_history.push(PendingInput {
            sequence,
            key,
            sent_at: now,
            resends: 0,
        });
    }

    /// Drops every acknowledged keystroke and checks the prediction.
    ///
    /// Returns the round trip of `sequence` if it was acked on its first send.
    pub fn apply_ack(&mut self, sequence: u32, counters: Counters) -> Option<Duration> {
        let round_trip = self
            .input_history
            .iter()
            .find(|input| input.sequence == sequence && input.resends == 0)
            .map(|input| input.sent_at.elapsed());
        self.input_history.retain(|input| input.sequence > sequence);
        self.confirmed = counters;
        self.set_stale(false);

        if self.input_history.is_empty() {
            if let (Some(room), Some(cursor)) = (self.room.as_ref(), self.cursor.as_ref()) {
                let predicted = cursor.counters(&room.text);
                if predicted != counters {
                    self.divergences += 1;
                    warn!(
                        "Prediction diverged at {}: local {} correct, server {}",
                        sequence, predicted.correct_chars, counters.correct_chars
                    );
                }
            }
        }
        round_trip
    }

    /// Merges a server event into the replica.
    pub fn apply_event(&mut self, event: &RaceEvent) -> Result<(), RaceError> {
        let replica = self.replica.as_mut().ok_or(RaceError::ConnectivityLost)?;
        replica.set_stale(false);
        replica.apply(event)
    }

    /// Keystrokes whose ack is overdue, marked as sent again at `now`.
    pub fn due_for_resend(&mut self, now: Instant, timeout: Duration) -> Vec<(u32, Keystroke)> {
        let mut due = Vec::new();
        let mut stale = false;
        for input in self
            .input_history
            .iter_mut()
            .filter(|input| now.duration_since(input.sent_at) >= timeout)
        {
            input.sent_at = now;
            input.resends += 1;
            stale |= input.resends >= STALE_AFTER_RESENDS;
            due.push((input.sequence, input.key));
        }

        if stale && !self.is_stale() {
            debug!("No acks after {} resends, marking view stale", STALE_AFTER_RESENDS);
            self.set_stale(true);
        }
        due
    }

    pub fn is_stale(&self) -> bool {
        self.replica.as_ref().map(|r| r.is_stale()).unwrap_or(false)
    }

    pub fn set_stale(&mut self, stale: bool) {
        if let Some(replica) = self.replica.as_mut() {
            replica.set_stale(stale);
        }
    }

    pub fn view(&self) -> RaceView {
        self.view_at(timestamp_ms())
    }

    /// The frame as of `now_ms`, unix milliseconds.
    pub fn view_at(&self, now_ms: u64) -> RaceView {
        let local_counters = match (self.room.as_ref(), self.cursor.as_ref()) {
            (Some(room), Some(cursor)) => Some(cursor.counters(&room.text)),
            _ => None,
        };
        RaceView {
            room: self.room.clone(),
            local_id: self.participant_id,
            view: self.replica.as_ref().map(|r| *r.view()).unwrap_or_default(),
            stale: self.is_stale(),
            leaderboard: self
                .replica
                .as_ref()
                .map(|r| r.leaderboard())
                .unwrap_or_default(),
            local_counters,
            local_stats: local_counters.and_then(|c| self.local_stats(&c, now_ms)),
            word_index: self.cursor.as_ref().map(|c| c.word_index()).unwrap_or(0),
            pending_inputs: self.input_history.len(),
        }
    }

    /// The clock stops at the local finish.
    fn local_stats(&self, counters: &Counters, now_ms: u64) -> Option<PlayerStats> {
        let replica = self.replica.as_ref()?;
        let started_at = replica.started_at()?;
        let until = self
            .participant_id
            .and_then(|id| replica.participant(id))
            .and_then(|p| p.finished_at)
            .unwrap_or(now_ms);
        Some(PlayerStats::compute(
            counters.correct_chars,
            counters.total_chars_typed,
            counters.mistakes,
            metrics::elapsed_seconds(started_at, until),
        ))
    }
}

impl Default for ClientRace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Participant, RoomId};

    fn snapshot(status: RoomStatus) -> RoomSnapshot {
        let mut view = RoomView::default();
        view.status = status;
        if status >= RoomStatus::Racing {
            view.started_at = Some(1_000);
        }
        RoomSnapshot {
            room_id: RoomId(1),
            code: RoomCode::new("ABCDEF"),
            text: RaceText::new("ab cd").unwrap(),
            capacity: 2,
            view,
            participants: vec![
                Participant::new(ParticipantId(1), "A".into(), RoomId(1), 0),
                Participant::new(ParticipantId(2), "B".into(), RoomId(1), 0),
            ],
            stale: false,
        }
    }

    fn racing() -> ClientRace {
        let mut race = ClientRace::new();
        race.apply_joined(ParticipantId(1), &snapshot(RoomStatus::Racing));
        race
    }

    #[test]
    fn test_no_prediction_before_race() {
        let mut race = ClientRace::new();
        assert_eq!(race.predict(Keystroke::Char('a')), None);

        race.apply_joined(ParticipantId(1), &snapshot(RoomStatus::Waiting));
        assert_eq!(race.predict(Keystroke::Char('a')), None);
    }

    #[test]
    fn test_prediction_updates_replica() {
        let mut race = racing();

        let outcome = race.predict(Keystroke::Char('a')).unwrap();
        assert!(matches!(outcome, KeystrokeOutcome::Progress(_)));

        let replica = race.replica().unwrap();
        assert_eq!(replica.participant(ParticipantId(1)).unwrap().correct_chars, 1);
        assert_eq!(race.view().local_counters.unwrap().progress_percent, 25.0);
    }

    #[test]
    fn test_local_stats_follow_the_clock() {
        let mut waiting = ClientRace::new();
        waiting.apply_joined(ParticipantId(1), &snapshot(RoomStatus::Waiting));
        assert_eq!(waiting.view_at(60_000).local_stats, None);

        let mut race = racing();
        race.predict(Keystroke::Char('a'));
        race.predict(Keystroke::Char('b'));
        let counters = race.view_at(7_000).local_counters.unwrap();

        // Six seconds after the start at 1_000.
        let stats = race.view_at(7_000).local_stats.unwrap();
        assert_eq!(
            stats,
            PlayerStats::compute(
                counters.correct_chars,
                counters.total_chars_typed,
                counters.mistakes,
                6.0
            )
        );
        assert!(stats.wpm > 0.0);
        assert!(race.view_at(13_000).local_stats.unwrap().cpm < stats.cpm);
    }

    #[test]
    fn test_unchanged_keystrokes_are_still_sent() {
        let mut race = racing();
        let outcome = race.predict(Keystroke::Backspace);
        assert!(matches!(outcome, Some(KeystrokeOutcome::Unchanged(_))));
    }

    #[test]
    fn test_finished_cursor_stops_sending() {
        let mut race = racing();
        for c in "ab cd".chars() {
            race.predict(Keystroke::from_char(c));
        }
        assert!(race.is_finished());
        assert_eq!(race.predict(Keystroke::Char('x')), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_clears_history() {
        let mut race = racing();
        let now = Instant::now();
        for (sequence, c) in (1..).zip("ab".chars()) {
            race.predict(Keystroke::Char(c));
            race.record_pending(sequence, Keystroke::Char(c), now);
        }
        assert_eq!(race.pending_inputs().len(), 2);

        let counters = race.view().local_counters.unwrap();
        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(
            race.apply_ack(1, Counters::default()),
            Some(Duration::from_millis(30))
        );
        assert_eq!(race.pending_inputs().len(), 1);

        race.apply_ack(2, counters);
        assert!(race.pending_inputs().is_empty());
        assert_eq!(race.confirmed(), counters);
        assert_eq!(race.divergences(), 0);
    }

    #[test]
    fn test_divergent_ack_is_counted() {
        let mut race = racing();
        race.predict(Keystroke::Char('a'));
        race.record_pending(1, Keystroke::Char('a'), Instant::now());

        race.apply_ack(1, Counters::default());
        assert_eq!(race.divergences(), 1);
    }

    #[test]
    fn test_stale_server_progress_does_not_rewind_prediction() {
        let mut race = racing();
        for c in "ab".chars() {
            race.predict(Keystroke::Char(c));
        }

        let old = RaceEvent::progress(
            ParticipantId(1),
            &Counters {
                correct_chars: 1,
                total_chars_typed: 1,
                mistakes: 0,
                progress_percent: 25.0,
                revision: 1,
            },
        );
        assert_eq!(race.apply_event(&old), Err(RaceError::StaleEvent));
        let replica = race.replica().unwrap();
        assert_eq!(replica.participant(ParticipantId(1)).unwrap().correct_chars, 2);
    }

    #[test]
    fn test_remote_finish_reaches_leaderboard() {
        let mut race = racing();
        race.apply_event(&RaceEvent::ParticipantFinished {
            participant_id: ParticipantId(2),
            wpm: 40.0,
            accuracy: 100.0,
            finished_at: 5_000,
        })
        .unwrap();

        let view = race.view();
        assert_eq!(view.leaderboard.winner().unwrap().participant_id, ParticipantId(2));
        assert_eq!(view.leaderboard.in_progress.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_after_timeout_marks_stale() {
        let mut race = racing();
        race.predict(Keystroke::Char('a'));
        race.record_pending(1, Keystroke::Char('a'), Instant::now());

        let timeout = Duration::from_millis(200);
        assert!(race.due_for_resend(Instant::now(), timeout).is_empty());

        for _ in 0..STALE_AFTER_RESENDS {
            tokio::time::advance(timeout).await;
            assert_eq!(
                race.due_for_resend(Instant::now(), timeout),
                vec![(1, Keystroke::Char('a'))]
            );
        }
        assert!(race.is_stale());
        assert!(race.view().stale);

        race.apply_ack(1, race.view().local_counters.unwrap());
        assert!(!race.is_stale());
    }
}
