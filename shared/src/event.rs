//! Facts broadcast over the room channel.
//!
//! Every event carries absolute values, never deltas, so re-applying an event or
//! applying a set of events in a different order leads to the same replica.

use crate::typing::Counters;
use crate::ParticipantId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaceEvent {
    ParticipantJoined {
        participant_id: ParticipantId,
        display_name: String,
        joined_at: u64,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    CountdownStarted {
        at: u64,
    },
    /// 3, 2, 1, then 0 for "go".
    CountdownTick {
        remaining: u8,
    },
    RaceStarted {
        started_at: u64,
    },
    ProgressUpdated {
        participant_id: ParticipantId,
        correct_chars: u32,
        total_chars_typed: u32,
        mistakes: u32,
        progress_percent: f64,
        revision: u32,
    },
    ParticipantFinished {
        participant_id: ParticipantId,
        wpm: f64,
        accuracy: f64,
        finished_at: u64,
    },
    RaceFinished {
        finished_at: u64,
    },
}

impl RaceEvent {
    pub fn progress(participant_id: ParticipantId, counters: &Counters) -> Self {
        RaceEvent::ProgressUpdated {
            participant_id,
            correct_chars: counters.correct_chars,
            total_chars_typed: counters.total_chars_typed,
            mistakes: counters.mistakes,
            progress_percent: counters.progress_percent,
            revision: counters.revision,
        }
    }

    /// The participant this event is about, if it is not a room-level fact.
    pub fn participant_id(&self) -> Option<ParticipantId> {
        match self {
            RaceEvent::ParticipantJoined { participant_id, .. }
            | RaceEvent::ParticipantLeft { participant_id }
            | RaceEvent::ProgressUpdated { participant_id, .. }
            | RaceEvent::ParticipantFinished { participant_id, .. } => Some(*participant_id),
            RaceEvent::CountdownStarted { .. }
            | RaceEvent::CountdownTick { .. }
            | RaceEvent::RaceStarted { .. }
            | RaceEvent::RaceFinished { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaceEvent::ParticipantJoined { .. } => "participant_joined",
            RaceEvent::ParticipantLeft { .. } => "participant_left",
            RaceEvent::CountdownStarted { .. } => "countdown_started",
            RaceEvent::CountdownTick { .. } => "countdown_tick",
            RaceEvent::RaceStarted { .. } => "race_started",
            RaceEvent::ProgressUpdated { .. } => "progress_updated",
            RaceEvent::ParticipantFinished { .. } => "participant_finished",
            RaceEvent::RaceFinished { .. } => "race_finished",
        }
    }
}
