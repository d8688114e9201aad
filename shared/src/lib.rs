//! Deterministic core shared by the race server and its clients.
//!
//! Everything in this crate is pure: the typing state machine, the metrics
//! formulas, the room lifecycle and the merge function that replicas apply to
//! broadcast events. Both sides run the exact same code, which is what lets a
//! client predict its own progress and still converge with the server.

pub mod error;
pub mod event;
pub mod leaderboard;
pub mod metrics;
pub mod participant;
pub mod room;
pub mod sync;
pub mod typing;

pub use error::RaceError;
pub use event::RaceEvent;
pub use leaderboard::{Leaderboard, Standing};
pub use metrics::PlayerStats;
pub use participant::Participant;
pub use room::{Room, RoomStatus};
pub use sync::{RaceReplica, RoomSnapshot, RoomView};
pub use typing::{Counters, Keystroke, KeystrokeOutcome, RaceText, TypingCursor};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bumped whenever the wire format changes; joins with another version are refused.
pub const CLIENT_VERSION: u32 = 1;

/// Countdown ticks before the race starts, one per second.
pub const COUNTDOWN_TICKS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub u32);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomId(pub u32);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-shareable room code. Always stored upper case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct RoomCode(String);

impl RoomCode {
    pub const ALPHABET: &'static [u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    pub const LEN: usize = 6;

    pub fn new(code: &str) -> Self {
        Self(code.trim().to_uppercase())
    }

    /// Normalizes `code` and checks it against [`RoomCode::ALPHABET`] and [`RoomCode::LEN`].
    pub fn parse(code: &str) -> Result<Self, RaceError> {
        let parsed = Self::new(code);
        if parsed.is_valid() {
            Ok(parsed)
        } else {
            Err(RaceError::InvalidRoomCode(code.to_string()))
        }
    }

    /// Codes decoded from the wire are only normalized; check before use.
    pub fn is_valid(&self) -> bool {
        self.0.len() == Self::LEN && self.0.bytes().all(|b| Self::ALPHABET.contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Broadcast topic for the room.
    pub fn topic(&self) -> String {
        format!("room:{}", self.0)
    }
}

impl From<String> for RoomCode {
    fn from(code: String) -> Self {
        Self::new(&code)
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unix time in milliseconds.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    CreateRoom {
        text: String,
        capacity: u8,
    },
    Join {
        client_version: u32,
        room_code: RoomCode,
        display_name: String,
    },
    StartRace,
    Keystroke {
        sequence: u32,
        key: Keystroke,
    },
    Leave,
    Heartbeat,

    RoomCreated {
        room_code: RoomCode,
    },
    Joined {
        participant_id: ParticipantId,
        snapshot: RoomSnapshot,
    },
    Ack {
        sequence: u32,
        counters: Counters,
    },
    Event(RaceEvent),
    Rejected {
        reason: String,
    },
    Disconnected {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_code_normalization() {
        let code = RoomCode::new("  ab12cd ");
        assert_eq!(code.as_str(), "AB12CD");
        assert_eq!(code, RoomCode::new("AB12CD"));
        assert_eq!(code.topic(), "room:AB12CD");
        assert_eq!(code.to_string(), "AB12CD");
    }

    #[test]
    fn test_room_code_parse_validates() {
        assert_eq!(RoomCode::parse(" ab12cd").unwrap().as_str(), "AB12CD");
        for bad in ["../OUTSIDE", "ABC12", "ABC1234", "AB-12C", "", "ÄBC123"] {
            assert_eq!(
                RoomCode::parse(bad),
                Err(RaceError::InvalidRoomCode(bad.to_string()))
            );
        }
        assert!(!RoomCode::new("../outside").is_valid());
    }

    #[test]
    fn test_room_code_deserializes_normalized() {
        let bytes = bincode::serialize(&"xyz789".to_string()).unwrap();
        let code: RoomCode = bincode::deserialize(&bytes).unwrap();
        assert_eq!(code.as_str(), "XYZ789");
    }

    #[test]
    fn test_id_display() {
        assert_eq!(ParticipantId(17).to_string(), "17");
        assert_eq!(RoomId(3).to_string(), "3");
    }

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01 in unix ms.
        assert!(timestamp_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_packet_serialization_join() {
        let packet = Packet::Join {
            client_version: CLIENT_VERSION,
            room_code: RoomCode::new("abcdef"),
            display_name: "Alice".to_string(),
        };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Join {
                client_version,
                room_code,
                display_name,
            } => {
                assert_eq!(client_version, CLIENT_VERSION);
                assert_eq!(room_code.as_str(), "ABCDEF");
                assert_eq!(display_name, "Alice");
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_keystroke() {
        let packet = Packet::Keystroke {
            sequence: 123,
            key: Keystroke::Char('ж'),
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Keystroke { sequence, key } => {
                assert_eq!(sequence, 123);
                assert_eq!(key, Keystroke::Char('ж'));
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_joined_snapshot() {
        let text = RaceText::new("ab cd").unwrap();
        let room = Room::new(RoomId(1), RoomCode::new("QWERTY"), text, 4, 0).unwrap();
        let mut replica = RaceReplica::for_room(&room);
        replica
            .apply(&RaceEvent::ParticipantJoined {
                participant_id: ParticipantId(1),
                display_name: "A".to_string(),
                joined_at: 10,
            })
            .unwrap();

        let packet = Packet::Joined {
            participant_id: ParticipantId(1),
            snapshot: replica.snapshot(&room),
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Joined {
                participant_id,
                snapshot,
            } => {
                assert_eq!(participant_id, ParticipantId(1));
                assert_eq!(snapshot.code.as_str(), "QWERTY");
                assert_eq!(snapshot.text.word_count(), 2);
                assert_eq!(snapshot.participants.len(), 1);
                assert_eq!(snapshot.view.status, RoomStatus::Waiting);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_event() {
        let packet = Packet::Event(RaceEvent::CountdownTick { remaining: 2 });
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, packet);
    }
}
