//! Countdown and race timeout timers for a room actor, plus the actor's clock.
//!
//! Each timer is a spawned task that sleeps and then posts a command back into
//! the actor's mailbox. Timers only go away when the room is closed or dropped.

use crate::room_actor::RoomCommand;
use log::{debug, trace};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    Countdown,
    RaceTimeout,
}

pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    commands: mpsc::Sender<RoomCommand>,
}

impl TimerManager {
    pub fn new(commands: mpsc::Sender<RoomCommand>) -> Self {
        Self {
            timers: HashMap::new(),
            commands,
        }
    }

    /// Posts `CountdownTick` for `ticks - 1` down to 0, one per `interval`.
    ///
    /// The caller announces the first value itself when the countdown begins.
    pub fn start_countdown(&mut self, ticks: u8, interval: Duration) {
        let commands = self.commands.clone();
        self.arm(TimerId::Countdown, async move {
            for remaining in (0..ticks).rev() {
                tokio::time::sleep(interval).await;
                trace!("Countdown tick {}", remaining);
                if commands
                    .send(RoomCommand::CountdownTick { remaining })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        debug!("Countdown armed: {} ticks every {:?}", ticks, interval);
    }

    pub fn start_race_timeout(&mut self, after: Duration) {
        let commands = self.commands.clone();
        self.arm(TimerId::RaceTimeout, async move {
            tokio::time::sleep(after).await;
            let _ = commands.send(RoomCommand::RaceTimeout).await;
        });
        debug!("Race timeout armed for {:?}", after);
    }

    fn arm<F>(&mut self, id: TimerId, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.cancel(id);
        self.timers.insert(id, tokio::spawn(task));
    }

    /// No-op if the timer does not exist or already fired.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            debug!("Timer {:?} cancelled", id);
        }
    }

    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!("Timer {:?} cancelled (shutdown)", id);
        }
    }

    /// Timers whose task has not completed yet.
    pub fn active_count(&self) -> usize {
        self.timers.values().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Wall-clock milliseconds derived from a monotonic instant.
///
/// Reading through `tokio::time::Instant` keeps elapsed race time monotonic
/// and lets paused-time tests advance it deterministically.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    epoch_ms: u64,
}

impl Clock {
    pub fn system() -> Self {
        Self::starting_at(shared::timestamp_ms())
    }

    pub fn starting_at(epoch_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            epoch_ms,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
