//! Ranking over a participant table.
//!
//! Always recomputed from scratch; nothing is patched incrementally.

use crate::participant::Participant;
use crate::ParticipantId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    /// 1-based.
    pub rank: usize,
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub wpm: f64,
    pub accuracy: f64,
    pub finished_at: Option<u64>,
}

/// Someone still typing, listed apart from the ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProgress {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub progress_percent: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Leaderboard {
    pub standings: Vec<Standing>,
    pub in_progress: Vec<InProgress>,
}

impl Leaderboard {
    pub fn winner(&self) -> Option<&Standing> {
        self.standings.first()
    }

    pub fn position(&self, participant_id: ParticipantId) -> Option<usize> {
        self.standings
            .iter()
            .find(|s| s.participant_id == participant_id)
            .map(|s| s.rank)
    }
}

/// Orders participants with a defined `wpm`: fastest first, earlier finish
/// breaking exact ties, a missing finish time after a present one, and the id
/// as a last resort so the order is total.
pub fn rank<'a>(participants: impl IntoIterator<Item = &'a Participant>) -> Leaderboard {
    let mut ranked = Vec::new();
    let mut in_progress = Vec::new();

    for p in participants {
        match p.wpm {
            Some(wpm) => ranked.push((p, wpm)),
            None => in_progress.push(InProgress {
                participant_id: p.id,
                display_name: p.display_name.clone(),
                progress_percent: p.progress_percent,
                active: p.active,
            }),
        }
    }

    ranked.sort_by(|(a, a_wpm), (b, b_wpm)| {
        b_wpm
            .total_cmp(a_wpm)
            .then_with(|| compare_finish(a.finished_at, b.finished_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    in_progress.sort_by(|a, b| {
        b.progress_percent
            .total_cmp(&a.progress_percent)
            .then_with(|| a.participant_id.cmp(&b.participant_id))
    });

    let standings = ranked
        .into_iter()
        .enumerate()
        .map(|(i, (p, wpm))| Standing {
            rank: i + 1,
            participant_id: p.id,
            display_name: p.display_name.clone(),
            wpm,
            accuracy: p.accuracy.unwrap_or(100.0),
            finished_at: p.finished_at,
        })
        .collect();

    Leaderboard {
        standings,
        in_progress,
    }
}

fn compare_finish(a: Option<u64>, b: Option<u64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
