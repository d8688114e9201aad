//! Keystroke sources and sequencing
//!
//! Keystrokes come either from stdin or from a bot that types the race text at
//! a target speed. Both feed the same channel; [`InputManager`] numbers each
//! keystroke that is actually sent so the server can restore their order.

use log::{debug, info};
use rand::Rng;
use shared::metrics::CHARS_PER_WORD;
use shared::{Keystroke, RaceText};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A keystroke with the sequence number it was sent under.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequencedKey {
    pub sequence: u32,
    pub key: Keystroke,
}

/// Numbers outgoing keystrokes, starting at 1 for every joined room.
pub struct InputManager {
    next_sequence: u32,
}

impl InputManager {
    pub fn new() -> Self {
        Self { next_sequence: 1 }
    }

    pub fn sequence(&mut self, key: Keystroke) -> SequencedKey {
        let input = SequencedKey {
            sequence: self.next_sequence,
            key,
        };
        self.next_sequence += 1;
        input
    }

    pub fn reset(&mut self) {
        self.next_sequence = 1;
    }

    pub fn last_sequence(&self) -> u32 {
        self.next_sequence - 1
    }
}

impl Default for InputManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards every character typed on stdin; a newline separates words.
pub fn spawn_stdin_source(keys: mpsc::UnboundedSender<Keystroke>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let keystrokes = line
                .chars()
                .map(Keystroke::from_char)
                .chain(std::iter::once(Keystroke::WordBoundary));
            for key in keystrokes {
                if keys.send(key).is_err() {
                    return;
                }
            }
        }
        debug!("Stdin closed");
    })
}

/// Types a race text at a fixed speed, optionally making and correcting mistakes.
#[derive(Debug, Clone, PartialEq)]
pub struct TypingBot {
    pub target_wpm: f64,
    /// Chance per character of typing a wrong character first.
    pub error_rate: f64,
}

impl TypingBot {
    pub fn new(target_wpm: f64, error_rate: f64) -> Self {
        Self {
            target_wpm: target_wpm.max(1.0),
            error_rate: error_rate.clamp(0.0, 1.0),
        }
    }

    /// Delay between two keystrokes for the target speed.
    pub fn key_interval(&self) -> Duration {
        Duration::from_micros((60_000_000.0 / (self.target_wpm * CHARS_PER_WORD)).round() as u64)
    }

    /// The full keystroke sequence for `text`, mistakes included.
    pub fn plan<R: Rng>(&self, text: &RaceText, rng: &mut R) -> Vec<Keystroke> {
        let mut keys = Vec::new();
        for index in 0..text.word_count() {
            let Some(word) = text.word(index) else {
                break;
            };
            if index > 0 {
                keys.push(Keystroke::WordBoundary);
            }
            for &expected in word {
                if rng.gen_bool(self.error_rate) {
                    keys.push(Keystroke::Char(wrong_char(expected, rng)));
                    keys.push(Keystroke::Backspace);
                }
                keys.push(Keystroke::Char(expected));
            }
        }
        keys
    }

    /// Plays the plan into `keys`, one keystroke per interval.
    pub fn spawn(self, text: RaceText, keys: mpsc::UnboundedSender<Keystroke>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let plan = self.plan(&text, &mut rand::thread_rng());
            let interval = self.key_interval();
            info!(
                "Bot typing {} keystrokes at {:.0} wpm",
                plan.len(),
                self.target_wpm
            );

            for key in plan {
                tokio::time::sleep(interval).await;
                if keys.send(key).is_err() {
                    return;
                }
            }
        })
    }
}

fn wrong_char<R: Rng>(expected: char, rng: &mut R) -> char {
    loop {
        let c = rng.gen_range(b'a'..=b'z') as char;
        if c != expected {
            return c;
        }
    }
}
