//! # Race Client Library
//!
//! Terminal client for multiplayer typing races. It joins or creates a room on
//! a race server, feeds keystrokes from stdin or from a typing bot, and draws
//! every racer's progress as text.
//!
//! ## Architecture Overview
//!
//! ### Client-Side Prediction
//! The client runs the same typing state machine as the server and applies each
//! keystroke immediately. Progress is shown without waiting for the server.
//!
//! ### Server Reconciliation
//! Each keystroke carries a sequence number. Acks from the server drop confirmed
//! keystrokes from the input history and report the authoritative counters, so
//! a diverging prediction is noticed. Unacknowledged keystrokes are resent, and
//! after repeated resends the view is flagged as reconnecting.
//!
//! ### Convergent Replica
//! Room events are merged into a local replica with the shared merge rules.
//! Duplicates and progress older than what is already shown are ignored.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! Local race state, prediction, the input history and the resend schedule.
//!
//! ### Input Module (`input`)
//! Keystroke sequencing, the stdin source and the typing bot.
//!
//! ### Network Module (`network`)
//! The UDP session with the server and the client's main loop.
//!
//! ### Rendering Module (`rendering`)
//! Plain-text frames with tracks, standings and connection quality.

pub mod game;
pub mod input;
pub mod network;
pub mod rendering;
