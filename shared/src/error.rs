use crate::room::RoomStatus;
use crate::{ParticipantId, RoomCode};
use thiserror::Error;

/// Failures of race operations.
///
/// None of these are fatal to the process; a rejected request leaves the room
/// exactly as it was.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RaceError {
    #[error("cannot {action} while room is {status}")]
    InvalidState {
        status: RoomStatus,
        action: &'static str,
    },

    #[error("participant {0} is not allowed to start this room")]
    Unauthorized(ParticipantId),

    #[error("event is older than the locally held state")]
    StaleEvent,

    #[error("broadcast channel connection lost")]
    ConnectivityLost,

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("room is full ({capacity} participants)")]
    RoomFull { capacity: u8 },

    #[error("room capacity must be between {min} and {max}, got {got}")]
    InvalidCapacity { got: u8, min: u8, max: u8 },

    #[error("race text contains no words")]
    EmptyText,

    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    #[error("participant {0} has already finished")]
    AlreadyFinished(ParticipantId),

    #[error("no room with code {0}")]
    UnknownRoom(RoomCode),

    #[error("invalid room code {0:?}: expected {len} characters from A-Z and 0-9", len = RoomCode::LEN)]
    InvalidRoomCode(String),

    #[error("room has been closed")]
    RoomClosed,
}
