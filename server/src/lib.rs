//! # Race Server Library
//!
//! Authoritative server for multiplayer typing races. Clients create a room
//! around a passage of text, join it by its six character code, and type the
//! passage keystroke by keystroke while the server scores them and keeps every
//! observer of the room converged on the same standings.
//!
//! ## Core Responsibilities
//!
//! ### Room Ownership
//! Each live room is owned by a single actor task. Joins, the countdown, every
//! keystroke and the final ranking are decided there, in order, so no two
//! requests can interleave inside a room.
//!
//! ### Synchronization
//! Accepted events are published on the room's topic. Events from other
//! observers are merged with the same rules the actor applies to its own, so
//! duplicates and reordering are harmless. When the broadcast link drops, the
//! room keeps working locally and resynchronizes from the store once it returns.
//!
//! ### Persistence
//! Rooms and participant records are written behind the race through a flush
//! task. A slow or failing store never delays a keystroke.
//!
//! ## Module Organization
//!
//! ### Room Actor (`room_actor`)
//! The single writer for a room and the cloneable handle used to reach it.
//!
//! ### Registry (`registry`)
//! Live rooms keyed by code; spawns actors from the store on first use.
//!
//! ### Timers (`timers`)
//! Countdown ticks, the optional race timeout and the actor's clock.
//!
//! ### Bus (`bus`)
//! The broadcast seam and its in-process implementation.
//!
//! ### Store (`store`)
//! The persistence seam with in-memory and JSON-file implementations.
//!
//! ### Client Manager (`client_manager`)
//! UDP peers, their room sessions and keystroke sequencing.
//!
//! ### Network (`network`)
//! Socket tasks and packet handling.
//!
//! ### Config (`config`)
//! Command line arguments and their validation.

pub mod bus;
pub mod client_manager;
pub mod config;
pub mod network;
pub mod registry;
pub mod room_actor;
pub mod store;
pub mod timers;

pub use bus::{Connectivity, LocalBus, Transport};
pub use config::{Args, ServerConfig, StorageConfig};
pub use network::Server;
pub use registry::RoomRegistry;
pub use room_actor::{ActorOptions, RoomHandle};
pub use store::{JsonFileStore, MemoryStore, RaceStore};
