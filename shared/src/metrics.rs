//! Typing-speed metrics shared by every observer of a race.
//!
//! All functions are pure and deterministic. Results are rounded to two decimal
//! places on the scaled value so that two observers computing the same metric from
//! the same counters always agree bit-for-bit on the published number.

use serde::{Deserialize, Serialize};

/// Characters per "word" in the standard WPM conversion.
pub const CHARS_PER_WORD: f64 = 5.0;

/// Rounds half-up to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Gross words per minute from correctly typed characters.
///
/// Returns 0 when no time has elapsed.
pub fn wpm(correct_chars: u32, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        return 0.0;
    }
    let words = correct_chars as f64 / CHARS_PER_WORD;
    let minutes = elapsed_seconds / 60.0;
    round2(words / minutes)
}

/// Net words per minute: every mistake cancels one correct character, floored at 0.
pub fn net_wpm(correct_chars: u32, mistakes: u32, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        return 0.0;
    }
    let net_correct = correct_chars.saturating_sub(mistakes);
    let words = net_correct as f64 / CHARS_PER_WORD;
    let minutes = elapsed_seconds / 60.0;
    round2(words / minutes)
}

/// Percentage of typed characters that were correct.
///
/// No attempt at all counts as perfect accuracy.
pub fn accuracy(correct_chars: u32, total_chars_typed: u32) -> f64 {
    if total_chars_typed == 0 {
        return 100.0;
    }
    round2(100.0 * correct_chars as f64 / total_chars_typed as f64)
}

/// Raw characters per minute, counting every typed character.
pub fn cpm(total_chars_typed: u32, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        return 0.0;
    }
    let minutes = elapsed_seconds / 60.0;
    round2(total_chars_typed as f64 / minutes)
}

/// Seconds between two unix-millisecond timestamps, never negative.
pub fn elapsed_seconds(started_at: u64, now: u64) -> f64 {
    now.saturating_sub(started_at) as f64 / 1000.0
}

/// Every metric for one participant at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub wpm: f64,
    pub net_wpm: f64,
    pub accuracy: f64,
    pub cpm: f64,
    pub correct_chars: u32,
    pub mistakes: u32,
}

impl PlayerStats {
    pub fn compute(
        correct_chars: u32,
        total_chars_typed: u32,
        mistakes: u32,
        elapsed_seconds: f64,
    ) -> Self {
        Self {
            wpm: wpm(correct_chars, elapsed_seconds),
            net_wpm: net_wpm(correct_chars, mistakes, elapsed_seconds),
            accuracy: accuracy(correct_chars, total_chars_typed),
            cpm: cpm(total_chars_typed, elapsed_seconds),
            correct_chars,
            mistakes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_wpm_reference_values() {
        assert_eq!(wpm(250, 60.0), 50.0);
        assert_eq!(wpm(125, 30.0), 50.0);
        assert_eq!(wpm(4, 60.0), 0.8);
    }

    #[test]
    fn test_wpm_zero_elapsed() {
        assert_eq!(wpm(0, 0.0), 0.0);
        assert_eq!(wpm(500, 0.0), 0.0);
        assert_eq!(wpm(500, -3.0), 0.0);
    }

    #[test]
    fn test_net_wpm() {
        assert_eq!(net_wpm(250, 25, 60.0), 45.0);
        assert_eq!(net_wpm(50, 100, 60.0), 0.0);
        assert_eq!(net_wpm(50, 0, 0.0), 0.0);
    }

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(100, 100), 100.0);
        assert_eq!(accuracy(80, 100), 80.0);
        assert_eq!(accuracy(0, 0), 100.0);
        assert_eq!(accuracy(1, 3), 33.33);
        assert_eq!(accuracy(2, 3), 66.67);
    }

    #[test]
    fn test_cpm() {
        assert_eq!(cpm(300, 60.0), 300.0);
        assert_eq!(cpm(300, 0.0), 0.0);
        assert_approx_eq!(cpm(7, 9.0), 46.67, 1e-9);
    }

    #[test]
    fn test_round2_half_up() {
        assert_eq!(round2(2.5), 2.5);
        assert_eq!(round2(0.125), 0.13);
        assert_eq!(round2(33.333333), 33.33);
    }

    #[test]
    fn test_elapsed_seconds() {
        assert_approx_eq!(elapsed_seconds(1_000, 61_000), 60.0, 1e-9);
        assert_eq!(elapsed_seconds(5_000, 1_000), 0.0);
    }

    #[test]
    fn test_player_stats_bundle() {
        let stats = PlayerStats::compute(250, 275, 25, 60.0);
        assert_eq!(stats.wpm, 50.0);
        assert_eq!(stats.net_wpm, 45.0);
        assert_eq!(stats.accuracy, 90.91);
        assert_eq!(stats.cpm, 275.0);
        assert_eq!(stats.correct_chars, 250);
        assert_eq!(stats.mistakes, 25);
    }
}
