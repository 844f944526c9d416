//! Room membership.
//!
//! Each joined client owns exactly one entry in the room's `players`
//! sub-collection, held by a [`Membership`]. Releasing the membership removes
//! that entry and nothing else, so two tabs with the same display name never
//! evict each other.

use std::sync::Arc;

use serde_json::json;

use crate::error::{Error, Result};
use crate::store::{Collection, SharedStore, Subscription};
use crate::types::{PLAYERS_PATH, Player, RoomId};

pub const MAX_NAME_LEN: usize = 32;

pub fn validate_name(display_name: &str) -> Result<String> {
    let name = display_name.trim();
    if name.is_empty() {
        return Err(Error::InvalidName("display name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "display name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

/// Adds this client to the room and returns the handle that removes it.
pub async fn join(
    store: Arc<dyn SharedStore>,
    room_id: &RoomId,
    display_name: &str,
) -> Result<Membership> {
    let name = validate_name(display_name)?;
    let key = store
        .subcollection_add(room_id.as_str(), PLAYERS_PATH, json!({ "displayName": name }))
        .await?;
    tracing::info!("{} joined room {} as {}", name, room_id, key);

    Ok(Membership {
        store,
        room_id: room_id.clone(),
        key,
        display_name: name,
        released: false,
    })
}

/// Live membership list for a room.
pub async fn watch(store: &dyn SharedStore, room_id: &RoomId) -> Result<Subscription<Collection>> {
    store
        .subcollection_subscribe(room_id.as_str(), PLAYERS_PATH)
        .await
}

/// Decodes a `players` snapshot in join order. Entries that are not player
/// records are skipped.
pub fn players_from(collection: &Collection) -> Vec<Player> {
    collection
        .iter()
        .filter_map(|(key, value)| {
            let mut player: Player = serde_json::from_value(value.clone()).ok()?;
            player.player_key = key.clone();
            Some(player)
        })
        .collect()
}

/// One client's presence entry. Dropping it without [`Membership::leave`]
/// still schedules the removal on the current runtime.
pub struct Membership {
    store: Arc<dyn SharedStore>,
    room_id: RoomId,
    key: String,
    display_name: String,
    released: bool,
}

impl Membership {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Removes exactly the entry created at join.
    pub async fn leave(mut self) -> Result<()> {
        self.released = true;
        let result = self
            .store
            .subcollection_remove(self.room_id.as_str(), PLAYERS_PATH, &self.key)
            .await;
        match &result {
            Ok(()) => tracing::info!("{} left room {}", self.display_name, self.room_id),
            Err(e) => tracing::warn!("Failed to remove {} from room {}: {}", self.key, self.room_id, e),
        }
        result
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = self.store.clone();
        let room_id = self.room_id.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store
                        .subcollection_remove(room_id.as_str(), PLAYERS_PATH, &key)
                        .await
                    {
                        tracing::warn!("Failed to remove {} from room {}: {}", key, room_id, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("No runtime to remove {} from room {}", key, room_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn room() -> RoomId {
        RoomId::parse("r1").unwrap()
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("  ana ").unwrap(), "ana");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let store = Arc::new(MemoryStore::new());
        let mut feed = watch(store.as_ref(), &room()).await.unwrap();
        assert!(feed.next().await.unwrap().is_empty());

        let membership = join(store.clone(), &room(), "ana").await.unwrap();
        let players = players_from(&feed.next().await.unwrap());
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].display_name, "ana");
        assert_eq!(players[0].player_key, membership.key());

        membership.leave().await.unwrap();
        assert!(feed.next().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_name_sessions_are_independent() {
        let store = Arc::new(MemoryStore::new());
        let first = join(store.clone(), &room(), "ana").await.unwrap();
        let second = join(store.clone(), &room(), "ana").await.unwrap();
        let second_key = second.key().to_string();

        first.leave().await.unwrap();

        let mut feed = watch(store.as_ref(), &room()).await.unwrap();
        let players = players_from(&feed.next().await.unwrap());
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].player_key, second_key);
        drop(second);
    }

    #[tokio::test]
    async fn test_drop_releases_entry() {
        let store = Arc::new(MemoryStore::new());
        let mut feed = watch(store.as_ref(), &room()).await.unwrap();
        let _ = feed.next().await;

        let membership = join(store.clone(), &room(), "bea").await.unwrap();
        assert_eq!(feed.next().await.unwrap().len(), 1);

        drop(membership);
        assert!(feed.next().await.unwrap().is_empty());
    }

    #[test]
    fn test_players_from_skips_garbage() {
        let mut collection = Collection::new();
        collection.insert("a".into(), json!({ "displayName": "ana" }));
        collection.insert("b".into(), json!(42));
        let players = players_from(&collection);
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].player_key, "a");
    }
}
