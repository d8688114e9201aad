use crate::game::RaceView;
use shared::{ParticipantId, RoomStatus};
use std::fmt::Write;

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Characters between the brackets of a progress track.
    pub track_width: usize,
    pub ping_ms: u64,
    pub fake_ping_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            track_width: 30,
            ping_ms: 0,
            fake_ping_ms: 0,
        }
    }
}

/// Draws the race as plain text, only when something visible changed.
pub struct Renderer {
    last_frame: Option<String>,
}

impl Renderer {
    pub fn new() -> Self {
        Renderer { last_frame: None }
    }

    /// Prints the frame if it differs from the previous one.
    pub fn render(&mut self, view: &RaceView, config: &RenderConfig) -> bool {
        let frame = render_frame(view, config);
        if self.last_frame.as_deref() == Some(frame.as_str()) {
            return false;
        }
        println!("{}", frame);
        self.last_frame = Some(frame);
        true
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn render_frame(view: &RaceView, config: &RenderConfig) -> String {
    let mut frame = String::new();
    let Some(room) = view.room.as_ref() else {
        frame.push_str("Connecting...");
        return frame;
    };

    let board = &view.leaderboard;
    let present = board.standings.len() + board.in_progress.iter().filter(|p| p.active).count();
    let _ = write!(
        frame,
        "Room {} | {} | {}/{} | {}",
        room.code,
        view.view.status,
        present,
        room.capacity,
        ping_label(config.ping_ms + config.fake_ping_ms)
    );
    if view.stale {
        frame.push_str(" | reconnecting...");
    }
    frame.push('\n');

    match view.view.status {
        RoomStatus::Waiting => frame.push_str("Waiting for the race to start\n"),
        RoomStatus::Countdown => {
            let remaining = view.view.countdown.unwrap_or_default();
            let _ = writeln!(frame, "Starting in {}", remaining);
        }
        RoomStatus::Racing => {
            let _ = writeln!(frame, "> {}", room.text.as_str());
        }
        RoomStatus::Finished => frame.push_str("Race over\n"),
    }

    for standing in &board.standings {
        draw_track(
            &mut frame,
            &standing.display_name,
            100.0,
            is_local(view, standing.participant_id),
            config.track_width,
        );
    }
    for runner in board.in_progress.iter().filter(|p| p.active) {
        draw_track(
            &mut frame,
            &runner.display_name,
            runner.progress_percent,
            is_local(view, runner.participant_id),
            config.track_width,
        );
    }

    if let Some(counters) = view.local_counters {
        let _ = writeln!(
            frame,
            "You: word {}/{}, {} correct, {} mistakes, {} unacked",
            (view.word_index + 1).min(room.text.word_count()),
            room.text.word_count(),
            counters.correct_chars,
            counters.mistakes,
            view.pending_inputs
        );
    }
    if let Some(stats) = view.local_stats {
        let _ = writeln!(
            frame,
            "Speed: {:.0} wpm, {:.0} net wpm, {:.0} cpm, {:.2}% accuracy",
            stats.wpm, stats.net_wpm, stats.cpm, stats.accuracy
        );
    }

    if !board.standings.is_empty() {
        frame.push_str("Standings:\n");
        for standing in &board.standings {
            let _ = writeln!(
                frame,
                "{:>3}. {:<16} {:>7.2} wpm {:>6.2}%",
                standing.rank, standing.display_name, standing.wpm, standing.accuracy
            );
        }
    }

    frame.truncate(frame.trim_end().len());
    frame
}

fn is_local(view: &RaceView, participant_id: ParticipantId) -> bool {
    view.local_id == Some(participant_id)
}

fn draw_track(frame: &mut String, name: &str, percent: f64, local: bool, width: usize) {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * width as f64).round() as usize;
    let mut track = "=".repeat(filled);
    if filled < width {
        track.push('>');
        track.push_str(&" ".repeat(width - filled - 1));
    }
    let marker = if local { '*' } else { ' ' };
    let _ = writeln!(frame, "{}{:<16} [{}] {:>6.2}%", marker, name, track, percent);
}

fn ping_label(total_ping: u64) -> String {
    let bars = (total_ping / 20).min(10) as usize;
    format!("{}{} {}ms", "|".repeat(bars), ".".repeat(10 - bars), total_ping)
}
