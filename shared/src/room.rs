//! Room lifecycle state machine.
//!
//! ```text
//! Waiting ──▶ Countdown ──▶ Racing ──▶ Finished
//! ```
//!
//! Transitions only move forward. `started_at` is stamped exactly once, by the
//! owner of the room, at the `Countdown → Racing` transition and then broadcast so
//! every observer measures elapsed time from the same instant.

use crate::error::RaceError;
use crate::event::RaceEvent;
use crate::typing::RaceText;
use crate::{ParticipantId, RoomCode, RoomId};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_CAPACITY: u8 = 2;
pub const MAX_CAPACITY: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoomStatus {
    Waiting,
    Countdown,
    Racing,
    Finished,
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Countdown => "countdown",
            RoomStatus::Racing => "racing",
            RoomStatus::Finished => "finished",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub code: RoomCode,
    pub text: RaceText,
    pub capacity: u8,
    pub created_at: u64,
    status: RoomStatus,
    starter: Option<ParticipantId>,
    started_at: Option<u64>,
    finished_at: Option<u64>,
}

impl Room {
    pub fn new(
        id: RoomId,
        code: RoomCode,
        text: RaceText,
        capacity: u8,
        created_at: u64,
    ) -> Result<Self, RaceError> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(RaceError::InvalidCapacity {
                got: capacity,
                min: MIN_CAPACITY,
                max: MAX_CAPACITY,
            });
        }

        Ok(Self {
            id,
            code,
            text,
            capacity,
            created_at,
            status: RoomStatus::Waiting,
            starter: None,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    pub fn starter(&self) -> Option<ParticipantId> {
        self.starter
    }

    pub fn started_at(&self) -> Option<u64> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<u64> {
        self.finished_at
    }

    /// Records the room creator as the designated starter. Only the first call wins.
    pub fn assign_starter(&mut self, participant_id: ParticipantId) -> bool {
        if self.starter.is_some() {
            return false;
        }
        self.starter = Some(participant_id);
        true
    }

    /// Passes the starter role on while the room is still waiting.
    /// `None` leaves the role open for the next joiner.
    pub fn hand_over_starter(&mut self, next: Option<ParticipantId>) -> Result<(), RaceError> {
        self.expect(RoomStatus::Waiting, "hand over starter")?;
        self.starter = next;
        Ok(())
    }

    pub fn is_starter(&self, participant_id: ParticipantId) -> bool {
        self.starter == Some(participant_id)
    }

    /// `Waiting → Countdown`, requested by the designated starter.
    pub fn begin_countdown(
        &mut self,
        requested_by: ParticipantId,
        at: u64,
    ) -> Result<RaceEvent, RaceError> {
        if !self.is_starter(requested_by) {
            return Err(RaceError::Unauthorized(requested_by));
        }
        self.expect(RoomStatus::Waiting, "start countdown")?;

        self.status = RoomStatus::Countdown;
        Ok(RaceEvent::CountdownStarted { at })
    }

    /// `Countdown → Racing`; `at` becomes the room's `started_at`.
    pub fn start_race(&mut self, at: u64) -> Result<RaceEvent, RaceError> {
        self.expect(RoomStatus::Countdown, "start race")?;

        self.status = RoomStatus::Racing;
        self.started_at = Some(at);
        Ok(RaceEvent::RaceStarted { started_at: at })
    }

    /// `Racing → Finished`.
    pub fn finish(&mut self, at: u64) -> Result<RaceEvent, RaceError> {
        self.expect(RoomStatus::Racing, "finish race")?;

        self.status = RoomStatus::Finished;
        self.finished_at = Some(at);
        Ok(RaceEvent::RaceFinished { finished_at: at })
    }

    /// Adopts room-level facts learned from another observer.
    ///
    /// Only moves forward; timestamps already held are never overwritten.
    pub fn adopt(&mut self, status: RoomStatus, started_at: Option<u64>, finished_at: Option<u64>) {
        if status > self.status {
            self.status = status;
        }
        if self.started_at.is_none() {
            self.started_at = started_at;
        }
        if self.finished_at.is_none() {
            self.finished_at = finished_at;
        }
    }

    fn expect(&self, required: RoomStatus, action: &'static str) -> Result<(), RaceError> {
        if self.status != required {
            return Err(RaceError::InvalidState {
                status: self.status,
                action,
            });
        }
        Ok(())
    }
}
