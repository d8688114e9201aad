//! Persistence collaborator.
//!
//! The live race never waits on storage; the room actor forwards records to a
//! flush task and only reads back on startup or after a connectivity drop.
//! Two implementations are provided: [`MemoryStore`] for `--ephemeral` runs and
//! tests, and [`JsonFileStore`] which mirrors each room to `<dir>/<CODE>.json`.

use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use shared::{Participant, ParticipantId, RaceError, RaceText, Room, RoomCode, RoomId};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Attempts at drawing an unused room code before giving up.
const CODE_ATTEMPTS: usize = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed room document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown room {0}")]
    UnknownRoom(RoomId),

    #[error("could not find a free room code")]
    CodesExhausted,

    #[error(transparent)]
    Invalid(#[from] RaceError),

    #[error("store is unavailable")]
    Unavailable,
}

impl From<StoreError> for RaceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invalid(race) => race,
            other => RaceError::PersistenceFailure(other.to_string()),
        }
    }
}

/// CRUD surface the race core consumes.
pub trait RaceStore: Send + Sync + 'static {
    /// Persists a new room in `waiting` under a freshly generated code.
    fn create_room(
        &self,
        text: RaceText,
        capacity: u8,
        created_at: u64,
    ) -> impl Future<Output = Result<Room, StoreError>> + Send;

    fn room(&self, id: RoomId) -> impl Future<Output = Result<Option<Room>, StoreError>> + Send;

    /// Case-insensitive, since codes are normalized on construction.
    fn room_by_code(
        &self,
        code: RoomCode,
    ) -> impl Future<Output = Result<Option<Room>, StoreError>> + Send;

    fn update_room(&self, room: Room) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn upsert_participant(
        &self,
        participant: Participant,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn participant(
        &self,
        room_id: RoomId,
        id: ParticipantId,
    ) -> impl Future<Output = Result<Option<Participant>, StoreError>> + Send;

    fn participants(
        &self,
        room_id: RoomId,
    ) -> impl Future<Output = Result<Vec<Participant>, StoreError>> + Send;
}

/// Draws a code over [`RoomCode::ALPHABET`].
pub fn generate_code<R: Rng>(rng: &mut R) -> RoomCode {
    let code: String = (0..RoomCode::LEN)
        .map(|_| {
            let idx = rng.gen_range(0..RoomCode::ALPHABET.len());
            RoomCode::ALPHABET[idx] as char
        })
        .collect();
    RoomCode::new(&code)
}

fn unused_code(taken: impl Fn(&RoomCode) -> bool) -> Result<RoomCode, StoreError> {
    let mut rng = rand::thread_rng();
    (0..CODE_ATTEMPTS)
        .map(|_| generate_code(&mut rng))
        .find(|code| !taken(code))
        .ok_or(StoreError::CodesExhausted)
}

#[derive(Default)]
struct MemoryState {
    rooms: HashMap<RoomId, Room>,
    codes: HashMap<RoomCode, RoomId>,
    participants: HashMap<RoomId, BTreeMap<ParticipantId, Participant>>,
    next_room_id: u32,
}

/// In-process store. Writes can be switched off to exercise failure paths.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every write fails with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

impl RaceStore for MemoryStore {
    async fn create_room(
        &self,
        text: RaceText,
        capacity: u8,
        created_at: u64,
    ) -> Result<Room, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        let code = unused_code(|code| state.codes.contains_key(code))?;
        state.next_room_id += 1;
        let id = RoomId(state.next_room_id);
        let room = Room::new(id, code.clone(), text, capacity, created_at)?;

        state.codes.insert(code, id);
        state.rooms.insert(id, room.clone());
        Ok(room)
    }

    async fn room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.state.read().await.rooms.get(&id).cloned())
    }

    async fn room_by_code(&self, code: RoomCode) -> Result<Option<Room>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .codes
            .get(&code)
            .and_then(|id| state.rooms.get(id))
            .cloned())
    }

    async fn update_room(&self, room: Room) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        match state.rooms.get_mut(&room.id) {
            Some(slot) => {
                *slot = room;
                Ok(())
            }
            None => Err(StoreError::UnknownRoom(room.id)),
        }
    }

    async fn upsert_participant(&self, participant: Participant) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if !state.rooms.contains_key(&participant.room_id) {
            return Err(StoreError::UnknownRoom(participant.room_id));
        }
        state
            .participants
            .entry(participant.room_id)
            .or_default()
            .insert(participant.id, participant);
        Ok(())
    }

    async fn participant(
        &self,
        room_id: RoomId,
        id: ParticipantId,
    ) -> Result<Option<Participant>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .participants
            .get(&room_id)
            .and_then(|table| table.get(&id))
            .cloned())
    }

    async fn participants(&self, room_id: RoomId) -> Result<Vec<Participant>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .participants
            .get(&room_id)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// On-disk shape of one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoomDocument {
    room: Room,
    participants: Vec<Participant>,
}

/// One JSON document per room under a directory.
///
/// Documents are rewritten whole through a temporary file and a rename, so a
/// crash mid-write leaves the previous version in place.
pub struct JsonFileStore {
    dir: PathBuf,
    /// Room id to code, rebuilt from the directory on open.
    index: Mutex<HashMap<RoomId, RoomCode>>,
}

impl JsonFileStore {
    /// Opens (creating if needed) the data directory and indexes existing rooms.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let document = read_document(&path).await?;
            index.insert(document.room.id, document.room.code.clone());
        }

        info!("Opened room store at {} ({} rooms)", dir.display(), index.len());
        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    fn path_for(&self, code: &RoomCode) -> PathBuf {
        self.dir.join(format!("{}.json", code.as_str()))
    }

    async fn load(&self, code: &RoomCode) -> Result<Option<RoomDocument>, StoreError> {
        // Codes name files; anything outside the alphabet never names one of ours.
        if !code.is_valid() {
            return Ok(None);
        }
        let path = self.path_for(code);
        match tokio::fs::try_exists(&path).await? {
            true => Ok(Some(read_document(&path).await?)),
            false => Ok(None),
        }
    }

    async fn save(&self, document: &RoomDocument) -> Result<(), StoreError> {
        let path = self.path_for(&document.room.code);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    async fn code_of(&self, id: RoomId) -> Option<RoomCode> {
        self.index.lock().await.get(&id).cloned()
    }
}

async fn read_document(path: &Path) -> Result<RoomDocument, StoreError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl RaceStore for JsonFileStore {
    async fn create_room(
        &self,
        text: RaceText,
        capacity: u8,
        created_at: u64,
    ) -> Result<Room, StoreError> {
        // Held across the write so two creations cannot pick the same id or code.
        let mut index = self.index.lock().await;

        let code = unused_code(|code| index.values().any(|c| c == code))?;
        let id = RoomId(index.keys().map(|id| id.0).max().unwrap_or(0) + 1);
        let room = Room::new(id, code.clone(), text, capacity, created_at)?;

        self.save(&RoomDocument {
            room: room.clone(),
            participants: Vec::new(),
        })
        .await?;
        index.insert(id, code);
        Ok(room)
    }

    async fn room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
        match self.code_of(id).await {
            Some(code) => Ok(self.load(&code).await?.map(|doc| doc.room)),
            None => Ok(None),
        }
    }

    async fn room_by_code(&self, code: RoomCode) -> Result<Option<Room>, StoreError> {
        Ok(self.load(&code).await?.map(|doc| doc.room))
    }

    async fn update_room(&self, room: Room) -> Result<(), StoreError> {
        let _guard = self.index.lock().await;
        let mut document = self
            .load(&room.code)
            .await?
            .ok_or(StoreError::UnknownRoom(room.id))?;
        document.room = room;
        self.save(&document).await
    }

    async fn upsert_participant(&self, participant: Participant) -> Result<(), StoreError> {
        let index = self.index.lock().await;
        let code = index
            .get(&participant.room_id)
            .cloned()
            .ok_or(StoreError::UnknownRoom(participant.room_id))?;

        let mut document = self
            .load(&code)
            .await?
            .ok_or(StoreError::UnknownRoom(participant.room_id))?;
        match document
            .participants
            .iter_mut()
            .find(|p| p.id == participant.id)
        {
            Some(slot) => *slot = participant,
            None => document.participants.push(participant),
        }
        self.save(&document).await
    }

    async fn participant(
        &self,
        room_id: RoomId,
        id: ParticipantId,
    ) -> Result<Option<Participant>, StoreError> {
        Ok(self
            .participants(room_id)
            .await?
            .into_iter()
            .find(|p| p.id == id))
    }

    async fn participants(&self, room_id: RoomId) -> Result<Vec<Participant>, StoreError> {
        let Some(code) = self.code_of(room_id).await else {
            return Ok(Vec::new());
        };
        Ok(self
            .load(&code)
            .await?
            .map(|doc| doc.participants)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shared::RoomStatus;

    fn text() -> RaceText {
        RaceText::new("ab cd").unwrap()
    }

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "race-store-{}-{}-{}",
            name,
            std::process::id(),
            rand::random::<u32>()
        ))
    }

    #[test]
    fn test_generated_code_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let code = generate_code(&mut rng);
            assert_eq!(code.as_str().len(), RoomCode::LEN);
            assert!(code
                .as_str()
                .bytes()
                .all(|b| RoomCode::ALPHABET.contains(&b)));
        }
    }

    #[tokio::test]
    async fn test_memory_store_room_lifecycle() {
        let store = MemoryStore::new();
        let room = store.create_room(text(), 4, 100).await.unwrap();
        assert_eq!(room.id, RoomId(1));
        assert_eq!(room.status(), RoomStatus::Waiting);

        let lower = RoomCode::new(&room.code.as_str().to_lowercase());
        let found = store.room_by_code(lower).await.unwrap().unwrap();
        assert_eq!(found, room);

        let mut updated = room.clone();
        updated.assign_starter(ParticipantId(1));
        updated.begin_countdown(ParticipantId(1), 200).unwrap();
        store.update_room(updated).await.unwrap();
        let reloaded = store.room(room.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status(), RoomStatus::Countdown);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_invalid_capacity() {
        let store = MemoryStore::new();
        let err = store.create_room(text(), 1, 0).await.unwrap_err();
        assert!(matches!(
            RaceError::from(err),
            RaceError::InvalidCapacity { got: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_memory_store_participants() {
        let store = MemoryStore::new();
        let room = store.create_room(text(), 2, 0).await.unwrap();

        let mut alice = Participant::new(ParticipantId(1), "Alice".into(), room.id, 10);
        store.upsert_participant(alice.clone()).await.unwrap();
        alice.correct_chars = 3;
        store.upsert_participant(alice.clone()).await.unwrap();
        let bob = Participant::new(ParticipantId(2), "Bob".into(), room.id, 11);
        store.upsert_participant(bob).await.unwrap();

        let all = store.participants(room.id).await.unwrap();
        assert_eq!(all.len(), 2);
        let stored = store.participant(room.id, ParticipantId(1)).await.unwrap();
        assert_eq!(stored.unwrap().correct_chars, 3);

        let orphan = Participant::new(ParticipantId(9), "X".into(), RoomId(99), 0);
        assert!(matches!(
            store.upsert_participant(orphan).await,
            Err(StoreError::UnknownRoom(RoomId(99)))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_failure_switch() {
        let store = MemoryStore::new();
        let room = store.create_room(text(), 2, 0).await.unwrap();

        store.set_failing(true);
        let p = Participant::new(ParticipantId(1), "A".into(), room.id, 0);
        let err = store.upsert_participant(p.clone()).await.unwrap_err();
        assert!(matches!(
            RaceError::from(err),
            RaceError::PersistenceFailure(_)
        ));

        store.set_failing(false);
        store.upsert_participant(p).await.unwrap();
    }

    #[tokio::test]
    async fn test_json_store_persists_across_reopen() {
        let dir = temp_dir("reopen");
        let room = {
            let store = JsonFileStore::open(&dir).await.unwrap();
            let room = store.create_room(text(), 3, 42).await.unwrap();
            let mut p = Participant::new(ParticipantId(1), "Zoë".into(), room.id, 50);
            p.finish(12.5, 100.0, 900).unwrap();
            store.upsert_participant(p).await.unwrap();
            room
        };

        assert!(dir.join(format!("{}.json", room.code)).exists());

        let store = JsonFileStore::open(&dir).await.unwrap();
        let reloaded = store.room(room.id).await.unwrap().unwrap();
        assert_eq!(reloaded, room);
        assert_eq!(reloaded.text.as_str(), "ab cd");

        let participants = store.participants(room.id).await.unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].display_name, "Zoë");
        assert_eq!(participants[0].wpm, Some(12.5));

        let second = store.create_room(text(), 2, 0).await.unwrap();
        assert_eq!(second.id, RoomId(2));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_json_store_unknown_room() {
        let dir = temp_dir("unknown");
        let store = JsonFileStore::open(&dir).await.unwrap();

        assert!(store.room(RoomId(5)).await.unwrap().is_none());
        assert!(store
            .room_by_code(RoomCode::new("NOPE00"))
            .await
            .unwrap()
            .is_none());
        assert!(store.participants(RoomId(5)).await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_json_store_ignores_path_like_codes() {
        let dir = temp_dir("traversal");
        let store = JsonFileStore::open(&dir).await.unwrap();

        // A file outside the data directory that a crafted code could name.
        let name = format!("OUTSIDE{}", rand::random::<u32>());
        let outside = dir.parent().unwrap().join(format!("{}.json", name));
        std::fs::write(&outside, b"{}").unwrap();

        for code in [format!("../{}", name), "../../etc/passwd".to_string()] {
            assert!(store
                .room_by_code(RoomCode::new(&code))
                .await
                .unwrap()
                .is_none());
        }

        let _ = std::fs::remove_file(&outside);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
