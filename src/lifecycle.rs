//! Room creation and attachment.
//!
//! The store has no compare-and-swap, so two clients can both see "no room"
//! and both write an initializer. With [`InitStrategy::Seeded`] both
//! initializers carry the same target and the race is harmless. With
//! [`InitStrategy::Random`] the later initializer wins and may wipe reveals
//! made in between.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::store::SharedStore;
use crate::sync::merge_remote;
use crate::types::{PLAYERS_PATH, Room, RoomId, TOTAL_TILES};

/// How a client picks the target when it initializes a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitStrategy {
    /// Derived from the room id; every client computes the same value.
    #[default]
    Seeded,
    /// Fresh randomness; unguessable but racy.
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Initialize the room if it does not exist yet.
    Create,
    /// Only attach to an existing room.
    Join,
}

pub struct Lifecycle {
    store: Arc<dyn SharedStore>,
    strategy: InitStrategy,
    capacity: Option<usize>,
    clock: Arc<dyn Clock>,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn SharedStore>, settings: &Settings, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            strategy: settings.init_strategy,
            capacity: settings.capacity,
            clock,
        }
    }

    pub async fn create(&self, room_id: &RoomId) -> Result<Room> {
        self.attach(room_id, AttachMode::Create).await
    }

    pub async fn join(&self, room_id: &RoomId) -> Result<Room> {
        self.attach(room_id, AttachMode::Join).await
    }

    /// Reads the room and adopts it as-is, or initializes it when absent and
    /// `mode` allows.
    pub async fn attach(&self, room_id: &RoomId, mode: AttachMode) -> Result<Room> {
        self.check_capacity(room_id).await?;

        match self.store.read(room_id.as_str()).await? {
            Some(doc) => {
                // Existing game fields are never recomputed here; the seeded
                // room only fills fields an older document lacks.
                let fallback = Room::initial(seeded_target(room_id), self.clock.now_ms());
                let room = merge_remote(&fallback, &doc);
                tracing::info!("Attached to room {} (epoch {})", room_id, room.epoch);
                Ok(room)
            }
            None if mode == AttachMode::Join => Err(Error::RoomNotFound(room_id.to_string())),
            None => {
                let room = self.initial_room(room_id);
                self.store
                    .write_full(room_id.as_str(), room.to_document())
                    .await?;
                tracing::info!("Room created: {} ({:?} target)", room_id, self.strategy);
                Ok(room)
            }
        }
    }

    pub fn initial_room(&self, room_id: &RoomId) -> Room {
        let target = match self.strategy {
            InitStrategy::Seeded => seeded_target(room_id),
            InitStrategy::Random => random_target(),
        };
        Room::initial(target, self.clock.now_ms())
    }

    async fn check_capacity(&self, room_id: &RoomId) -> Result<()> {
        let Some(capacity) = self.capacity else {
            return Ok(());
        };

        let mut players = self
            .store
            .subcollection_subscribe(room_id.as_str(), PLAYERS_PATH)
            .await?;
        let count = players.next().await.map(|p| p.len()).unwrap_or(0);
        if count >= capacity {
            tracing::warn!("Rejected join to room {}: {} of {} players", room_id, count, capacity);
            return Err(Error::RoomFull {
                room_id: room_id.to_string(),
                capacity,
            });
        }
        Ok(())
    }
}

/// Target index derived only from the room id.
pub fn seeded_target(room_id: &RoomId) -> usize {
    let mut rng = StdRng::seed_from_u64(fnv1a(room_id.as_str().as_bytes()));
    rng.random_range(0..TOTAL_TILES)
}

pub fn random_target() -> usize {
    rand::rng().random_range(0..TOTAL_TILES)
}

/// FNV-1a, stable across platforms and releases unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}
