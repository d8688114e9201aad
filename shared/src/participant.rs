use crate::error::RaceError;
use crate::event::RaceEvent;
use crate::typing::Counters;
use crate::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};

/// One racer's progress and final score within a room.
///
/// Counters only ever move forward, and once `finished_at` is set the record is
/// frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub room_id: RoomId,
    pub joined_at: u64,
    pub correct_chars: u32,
    pub total_chars_typed: u32,
    pub mistakes: u32,
    pub progress_percent: f64,
    pub revision: u32,
    /// False once the participant has left; they no longer hold the race open.
    pub active: bool,
    pub finished_at: Option<u64>,
    pub wpm: Option<f64>,
    pub accuracy: Option<f64>,
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: String, room_id: RoomId, joined_at: u64) -> Self {
        Self {
            id,
            display_name,
            room_id,
            joined_at,
            correct_chars: 0,
            total_chars_typed: 0,
            mistakes: 0,
            progress_percent: 0.0,
            revision: 0,
            active: true,
            finished_at: None,
            wpm: None,
            accuracy: None,
        }
    }

    /// Entry for a participant only known from progress or finish events so far.
    pub fn placeholder(id: ParticipantId, room_id: RoomId) -> Self {
        Self::new(id, String::new(), room_id, 0)
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn counters(&self) -> Counters {
        Counters {
            correct_chars: self.correct_chars,
            total_chars_typed: self.total_chars_typed,
            mistakes: self.mistakes,
            progress_percent: self.progress_percent,
            revision: self.revision,
        }
    }

    /// Accepts a snapshot only if it is at least as new as the one held,
    /// ordered by `(total_chars_typed, revision)`.
    pub fn apply_progress(&mut self, counters: &Counters) -> Result<(), RaceError> {
        if self.is_finished() {
            return Err(RaceError::AlreadyFinished(self.id));
        }

        let incoming = (counters.total_chars_typed, counters.revision);
        let held = (self.total_chars_typed, self.revision);
        if incoming < held {
            return Err(RaceError::StaleEvent);
        }

        self.correct_chars = counters.correct_chars;
        self.total_chars_typed = counters.total_chars_typed;
        self.mistakes = counters.mistakes;
        self.progress_percent = counters.progress_percent;
        self.revision = counters.revision;
        Ok(())
    }

    /// Records the final score. The first finish is terminal.
    pub fn finish(&mut self, wpm: f64, accuracy: f64, finished_at: u64) -> Result<(), RaceError> {
        if self.is_finished() {
            return Err(RaceError::AlreadyFinished(self.id));
        }

        self.wpm = Some(wpm);
        self.accuracy = Some(accuracy);
        self.finished_at = Some(finished_at);
        Ok(())
    }

    /// Expresses this record as the absolute events that would rebuild it.
    pub fn to_events(&self) -> Vec<RaceEvent> {
        let mut events = vec![
            RaceEvent::ParticipantJoined {
                participant_id: self.id,
                display_name: self.display_name.clone(),
                joined_at: self.joined_at,
            },
            RaceEvent::progress(self.id, &self.counters()),
        ];

        if let (Some(wpm), Some(accuracy), Some(finished_at)) =
            (self.wpm, self.accuracy, self.finished_at)
        {
            events.push(RaceEvent::ParticipantFinished {
                participant_id: self.id,
                wpm,
                accuracy,
                finished_at,
            });
        }

        if !self.active {
            events.push(RaceEvent::ParticipantLeft {
                participant_id: self.id,
            });
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(correct: u32, total: u32, mistakes: u32, revision: u32) -> Counters {
        Counters {
            correct_chars: correct,
            total_chars_typed: total,
            mistakes,
            progress_percent: correct as f64 * 10.0,
            revision,
        }
    }

    #[test]
    fn test_participant_creation() {
        let p = Participant::new(ParticipantId(1), "Alice".to_string(), RoomId(3), 42);
        assert_eq!(p.display_name, "Alice");
        assert_eq!(p.room_id, RoomId(3));
        assert!(p.active);
        assert!(!p.is_finished());
        assert_eq!(p.counters(), Counters::default());
    }

    #[test]
    fn test_progress_monotonic_guard() {
        let mut p = Participant::new(ParticipantId(1), "A".to_string(), RoomId(1), 0);

        p.apply_progress(&counters(3, 4, 1, 4)).unwrap();
        assert_eq!(p.apply_progress(&counters(2, 3, 1, 3)), Err(RaceError::StaleEvent));
        assert_eq!(p.correct_chars, 3);

        // Backspace keeps total_chars_typed but bumps the revision.
        p.apply_progress(&counters(2, 4, 1, 5)).unwrap();
        assert_eq!(p.correct_chars, 2);
        assert_eq!(p.apply_progress(&counters(3, 4, 1, 4)), Err(RaceError::StaleEvent));
    }

    #[test]
    fn test_finish_is_terminal() {
        let mut p = Participant::new(ParticipantId(1), "A".to_string(), RoomId(1), 0);
        p.finish(40.0, 95.0, 1_000).unwrap();

        assert_eq!(p.finish(80.0, 100.0, 900), Err(RaceError::AlreadyFinished(ParticipantId(1))));
        assert_eq!(p.wpm, Some(40.0));
        assert_eq!(p.accuracy, Some(95.0));
        assert_eq!(p.finished_at, Some(1_000));

        assert_eq!(
            p.apply_progress(&counters(9, 9, 0, 99)),
            Err(RaceError::AlreadyFinished(ParticipantId(1)))
        );
    }

    #[test]
    fn test_to_events_rebuilds_record() {
        let mut p = Participant::new(ParticipantId(5), "Eve".to_string(), RoomId(1), 10);
        p.apply_progress(&counters(4, 5, 1, 6)).unwrap();
        p.finish(12.5, 80.0, 2_000).unwrap();
        p.active = false;

        let events = p.to_events();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], RaceEvent::ParticipantJoined { .. }));
        assert!(matches!(events[2], RaceEvent::ParticipantFinished { .. }));
        assert!(matches!(events[3], RaceEvent::ParticipantLeft { .. }));
    }
}
