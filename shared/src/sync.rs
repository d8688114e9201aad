//! Replicated view of a room and the merge function every observer applies.
//!
//! Local and remote events go through [`RaceReplica::apply`] alike. The merge is
//! idempotent and, for the monotonic fields, commutative: observers that accepted
//! the same set of events hold the same participant table whatever order the
//! events arrived in.

use crate::error::RaceError;
use crate::event::RaceEvent;
use crate::leaderboard::{self, Leaderboard};
use crate::participant::Participant;
use crate::room::{Room, RoomStatus};
use crate::typing::{Counters, RaceText};
use crate::{ParticipantId, RoomCode, RoomId};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Room-level facts as seen by one observer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoomView {
    pub status: RoomStatus,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    /// Last countdown value seen, 0 meaning "go".
    pub countdown: Option<u8>,
}

impl RoomView {
    pub fn new() -> Self {
        Self {
            status: RoomStatus::Waiting,
            started_at: None,
            finished_at: None,
            countdown: None,
        }
    }

    fn advance(&mut self, status: RoomStatus) {
        if status > self.status {
            self.status = status;
        }
    }
}

impl Default for RoomView {
    fn default() -> Self {
        Self::new()
    }
}

/// Read model handed to presentation and to joining clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub code: RoomCode,
    pub text: RaceText,
    pub capacity: u8,
    pub view: RoomView,
    pub participants: Vec<Participant>,
    /// Set while the broadcast channel is down; local play continues.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaceReplica {
    room_id: RoomId,
    view: RoomView,
    participants: BTreeMap<ParticipantId, Participant>,
    stale: bool,
}

impl RaceReplica {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            view: RoomView::new(),
            participants: BTreeMap::new(),
            stale: false,
        }
    }

    /// Seeds a replica from an authoritative room record.
    pub fn for_room(room: &Room) -> Self {
        let mut replica = Self::new(room.id);
        replica.view = RoomView {
            status: room.status(),
            started_at: room.started_at(),
            finished_at: room.finished_at(),
            countdown: None,
        };
        replica
    }

    pub fn from_snapshot(snapshot: &RoomSnapshot) -> Self {
        Self {
            room_id: snapshot.room_id,
            view: snapshot.view,
            participants: snapshot
                .participants
                .iter()
                .map(|p| (p.id, p.clone()))
                .collect(),
            stale: snapshot.stale,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn view(&self) -> &RoomView {
        &self.view
    }

    pub fn status(&self) -> RoomStatus {
        self.view.status
    }

    pub fn started_at(&self) -> Option<u64> {
        self.view.started_at
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.participants.values().filter(|p| p.active).count()
    }

    /// True when at least one participant is active and all active ones finished.
    pub fn all_active_finished(&self) -> bool {
        let mut active = self.participants.values().filter(|p| p.active).peekable();
        active.peek().is_some() && active.all(|p| p.is_finished())
    }

    /// Merges one event.
    ///
    /// `Err(StaleEvent)` and `Err(AlreadyFinished)` mean the event was discarded
    /// and the replica is unchanged.
    pub fn apply(&mut self, event: &RaceEvent) -> Result<(), RaceError> {
        let result = self.merge(event);
        if let Err(ref err) = result {
            debug!("Discarded {} event: {}", event.kind(), err);
        }
        result
    }

    fn merge(&mut self, event: &RaceEvent) -> Result<(), RaceError> {
        match event {
            RaceEvent::ParticipantJoined {
                participant_id,
                display_name,
                joined_at,
            } => {
                let participant = self.entry(*participant_id);
                // A finish that overtook its join still needs the name filled in.
                if participant.is_finished() && !participant.display_name.is_empty() {
                    return Err(RaceError::AlreadyFinished(*participant_id));
                }
                participant.display_name = display_name.clone();
                participant.joined_at = *joined_at;
                Ok(())
            }

            RaceEvent::ParticipantLeft { participant_id } => {
                let participant = self.entry(*participant_id);
                if participant.is_finished() {
                    return Err(RaceError::AlreadyFinished(*participant_id));
                }
                participant.active = false;
                Ok(())
            }

            RaceEvent::CountdownStarted { .. } => {
                if self.view.status >= RoomStatus::Countdown {
                    return Err(RaceError::StaleEvent);
                }
                self.view.advance(RoomStatus::Countdown);
                Ok(())
            }

            RaceEvent::CountdownTick { remaining } => {
                if self.view.status > RoomStatus::Countdown {
                    return Err(RaceError::StaleEvent);
                }
                if matches!(self.view.countdown, Some(seen) if seen <= *remaining) {
                    return Err(RaceError::StaleEvent);
                }
                self.view.advance(RoomStatus::Countdown);
                self.view.countdown = Some(*remaining);
                Ok(())
            }

            RaceEvent::RaceStarted { started_at } => {
                if self.view.started_at.is_some() {
                    return Err(RaceError::StaleEvent);
                }
                self.view.started_at = Some(*started_at);
                self.view.countdown = Some(0);
                self.view.advance(RoomStatus::Racing);
                Ok(())
            }

            RaceEvent::RaceFinished { finished_at } => {
                if self.view.finished_at.is_some() {
                    return Err(RaceError::StaleEvent);
                }
                self.view.finished_at = Some(*finished_at);
                self.view.advance(RoomStatus::Finished);
                Ok(())
            }

            RaceEvent::ProgressUpdated {
                participant_id,
                correct_chars,
                total_chars_typed,
                mistakes,
                progress_percent,
                revision,
            } => {
                let counters = Counters {
                    correct_chars: *correct_chars,
                    total_chars_typed: *total_chars_typed,
                    mistakes: *mistakes,
                    progress_percent: *progress_percent,
                    revision: *revision,
                };
                self.entry(*participant_id).apply_progress(&counters)
            }

            RaceEvent::ParticipantFinished {
                participant_id,
                wpm,
                accuracy,
                finished_at,
            } => self
                .entry(*participant_id)
                .finish(*wpm, *accuracy, *finished_at),
        }
    }

    fn entry(&mut self, id: ParticipantId) -> &mut Participant {
        let room_id = self.room_id;
        self.participants
            .entry(id)
            .or_insert_with(|| Participant::placeholder(id, room_id))
    }

    /// Merges a participant record read from persistence.
    ///
    /// Returns how many of the record's events changed this replica.
    pub fn merge_record(&mut self, record: &Participant) -> usize {
        let mut accepted = 0;
        for event in record.to_events() {
            let before = self.participants.get(&record.id).cloned();
            if self.apply(&event).is_ok() && before.as_ref() != self.participants.get(&record.id) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Fresh total order over finished participants.
    pub fn leaderboard(&self) -> Leaderboard {
        leaderboard::rank(self.participants.values())
    }

    pub fn snapshot(&self, room: &Room) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id,
            code: room.code.clone(),
            text: room.text.clone(),
            capacity: room.capacity,
            view: self.view,
            participants: self.participants.values().cloned().collect(),
            stale: self.stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(id: u32, correct: u32, total: u32, revision: u32) -> RaceEvent {
        RaceEvent::ProgressUpdated {
            participant_id: ParticipantId(id),
            correct_chars: correct,
            total_chars_typed: total,
            mistakes: total - correct,
            progress_percent: correct as f64 * 25.0,
            revision,
        }
    }

    fn finished(id: u32, wpm: f64, at: u64) -> RaceEvent {
        RaceEvent::ParticipantFinished {
            participant_id: ParticipantId(id),
            wpm,
            accuracy: 100.0,
            finished_at: at,
        }
    }

    fn joined(id: u32, name: &str) -> RaceEvent {
        RaceEvent::ParticipantJoined {
            participant_id: ParticipantId(id),
            display_name: name.to_string(),
            joined_at: 100,
        }
    }

    #[test]
    fn test_progress_idempotent() {
        let mut replica = RaceReplica::new(RoomId(1));
        replica.apply(&joined(1, "A")).unwrap();

        let event = progress(1, 2, 3, 3);
        replica.apply(&event).unwrap();
        let once = replica.clone();
        replica.apply(&event).unwrap();

        assert_eq!(replica, once);
    }

    #[test]
    fn test_progress_commutative_under_guard() {
        let older = progress(1, 1, 2, 2);
        let newer = progress(1, 3, 4, 4);

        let mut a = RaceReplica::new(RoomId(1));
        a.apply(&older).unwrap();
        a.apply(&newer).unwrap();

        let mut b = RaceReplica::new(RoomId(1));
        b.apply(&newer).unwrap();
        assert_eq!(b.apply(&older), Err(RaceError::StaleEvent));

        assert_eq!(a, b);
        assert_eq!(a.participant(ParticipantId(1)).unwrap().correct_chars, 3);
    }

    #[test]
    fn test_progress_before_join_converges() {
        let events = [joined(7, "Late"), progress(7, 4, 4, 4)];

        let mut in_order = RaceReplica::new(RoomId(1));
        let mut reversed = RaceReplica::new(RoomId(1));
        for e in &events {
            in_order.apply(e).unwrap();
        }
        for e in events.iter().rev() {
            reversed.apply(e).unwrap();
        }

        assert_eq!(in_order, reversed);
        assert_eq!(reversed.participant(ParticipantId(7)).unwrap().display_name, "Late");
    }

    #[test]
    fn test_finish_is_terminal_and_blocks_progress() {
        let mut replica = RaceReplica::new(RoomId(1));
        replica.apply(&finished(1, 50.0, 1_000)).unwrap();

        assert_eq!(
            replica.apply(&finished(1, 99.0, 900)),
            Err(RaceError::AlreadyFinished(ParticipantId(1)))
        );
        assert!(replica.apply(&progress(1, 9, 9, 50)).is_err());

        let p = replica.participant(ParticipantId(1)).unwrap();
        assert_eq!(p.wpm, Some(50.0));
        assert_eq!(p.finished_at, Some(1_000));
    }

    #[test]
    fn test_room_status_merges_monotonically() {
        let mut replica = RaceReplica::new(RoomId(1));

        replica.apply(&RaceEvent::RaceStarted { started_at: 500 }).unwrap();
        assert_eq!(replica.status(), RoomStatus::Racing);

        assert_eq!(
            replica.apply(&RaceEvent::CountdownStarted { at: 100 }),
            Err(RaceError::StaleEvent)
        );
        assert_eq!(
            replica.apply(&RaceEvent::CountdownTick { remaining: 2 }),
            Err(RaceError::StaleEvent)
        );
        assert_eq!(
            replica.apply(&RaceEvent::RaceStarted { started_at: 900 }),
            Err(RaceError::StaleEvent)
        );
        assert_eq!(replica.started_at(), Some(500));
        assert_eq!(replica.status(), RoomStatus::Racing);
    }

    #[test]
    fn test_countdown_ticks_only_decrease() {
        let mut replica = RaceReplica::new(RoomId(1));
        replica.apply(&RaceEvent::CountdownStarted { at: 0 }).unwrap();
        replica.apply(&RaceEvent::CountdownTick { remaining: 3 }).unwrap();
        replica.apply(&RaceEvent::CountdownTick { remaining: 1 }).unwrap();
        assert!(replica.apply(&RaceEvent::CountdownTick { remaining: 2 }).is_err());
        assert_eq!(replica.view().countdown, Some(1));
    }

    #[test]
    fn test_all_active_finished_ignores_leavers() {
        let mut replica = RaceReplica::new(RoomId(1));
        assert!(!replica.all_active_finished());

        replica.apply(&joined(1, "A")).unwrap();
        replica.apply(&joined(2, "B")).unwrap();
        replica.apply(&finished(1, 30.0, 10)).unwrap();
        assert!(!replica.all_active_finished());

        replica
            .apply(&RaceEvent::ParticipantLeft {
                participant_id: ParticipantId(2),
            })
            .unwrap();
        assert!(replica.all_active_finished());
        assert_eq!(replica.active_count(), 1);
    }

    #[test]
    fn test_merge_record_from_persistence() {
        let mut source = RaceReplica::new(RoomId(1));
        source.apply(&joined(3, "C")).unwrap();
        source.apply(&progress(3, 2, 2, 2)).unwrap();
        let record = source.participant(ParticipantId(3)).unwrap().clone();

        let mut target = RaceReplica::new(RoomId(1));
        // The join and the progress are both new.
        assert_eq!(target.merge_record(&record), 2);
        assert_eq!(target.merge_record(&record), 0);
        assert_eq!(target.participant(ParticipantId(3)), Some(&record));
    }

    #[test]
    fn test_finished_record_is_immutable() {
        let mut replica = RaceReplica::new(RoomId(1));
        replica.apply(&joined(1, "A")).unwrap();
        replica.apply(&finished(1, 40.0, 2_000)).unwrap();
        let before = replica.participant(ParticipantId(1)).unwrap().clone();

        assert_eq!(
            replica.apply(&RaceEvent::ParticipantJoined {
                participant_id: ParticipantId(1),
                display_name: "Mallory".to_string(),
                joined_at: 999,
            }),
            Err(RaceError::AlreadyFinished(ParticipantId(1)))
        );
        assert_eq!(
            replica.apply(&RaceEvent::ParticipantLeft {
                participant_id: ParticipantId(1),
            }),
            Err(RaceError::AlreadyFinished(ParticipantId(1)))
        );
        assert_eq!(replica.participant(ParticipantId(1)), Some(&before));
    }

    #[test]
    fn test_finish_before_join_still_gets_name() {
        let mut replica = RaceReplica::new(RoomId(1));
        replica.apply(&finished(4, 35.0, 3_000)).unwrap();
        replica.apply(&joined(4, "D")).unwrap();

        let p = replica.participant(ParticipantId(4)).unwrap();
        assert_eq!(p.display_name, "D");
        assert_eq!(p.joined_at, 100);
        assert_eq!(p.wpm, Some(35.0));
        assert!(p.active);
    }
}
