//! Live room actors keyed by room code.
//!
//! Rooms are created through the store and opened lazily: the first client to
//! join a code spawns its actor from the persisted room and participant table.

use crate::bus::Transport;
use crate::room_actor::{ActorOptions, RoomActor, RoomHandle};
use crate::store::RaceStore;
use log::{debug, info, warn};
use shared::{RaceError, RaceText, Room, RoomCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct RoomRegistry<S: RaceStore> {
    store: Arc<S>,
    transport: Arc<dyn Transport>,
    options: ActorOptions,
    rooms: Mutex<HashMap<RoomCode, RoomHandle>>,
}

impl<S: RaceStore> RoomRegistry<S> {
    pub fn new(store: Arc<S>, transport: Arc<dyn Transport>, options: ActorOptions) -> Self {
        Self {
            store,
            transport,
            options,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Validates and persists a new room in `waiting`. No actor is started yet.
    pub async fn create_room(&self, text: &str, capacity: u8) -> Result<Room, RaceError> {
        let text = RaceText::new(text)?;
        let room = self
            .store
            .create_room(text, capacity, self.options.clock.now_ms())
            .await?;
        info!(
            "Created room {} ({} words, capacity {})",
            room.code,
            room.text.word_count(),
            room.capacity
        );
        Ok(room)
    }

    /// Returns the live actor for `code`, spawning it from the store if needed.
    pub async fn open(&self, code: &RoomCode) -> Result<RoomHandle, RaceError> {
        if !code.is_valid() {
            return Err(RaceError::InvalidRoomCode(code.to_string()));
        }
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(code) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            debug!("Room {} actor has stopped, reopening", code);
        }

        let room = self
            .store
            .room_by_code(code.clone())
            .await?
            .ok_or_else(|| RaceError::UnknownRoom(code.clone()))?;
        let participants = self.store.participants(room.id).await?;

        let handle = RoomActor::spawn(
            room,
            participants,
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.options.clone(),
        );
        rooms.insert(code.clone(), handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, code: &RoomCode) -> Option<RoomHandle> {
        self.rooms
            .lock()
            .await
            .get(code)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub async fn close(&self, code: &RoomCode) -> Result<(), RaceError> {
        let handle = self.rooms.lock().await.remove(code);
        match handle {
            Some(handle) => handle.close().await,
            None => Err(RaceError::UnknownRoom(code.clone())),
        }
    }

    /// Closes every live room, draining their pending writes.
    pub async fn close_all(&self) {
        let handles: Vec<RoomHandle> = self.rooms.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.close().await {
                warn!("Room {} did not close cleanly: {}", handle.code(), e);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
