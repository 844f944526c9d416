use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{Collection, SharedStore, Subscription, apply_partial};
use crate::types::Document;

#[derive(Default)]
struct CollectionSlot {
    entries: Collection,
    subscribers: Vec<mpsc::UnboundedSender<Collection>>,
}

impl CollectionSlot {
    fn is_vacant(&self) -> bool {
        self.entries.is_empty() && self.subscribers.iter().all(|tx| tx.is_closed())
    }

    fn notify(&mut self) {
        let entries = &self.entries;
        self.subscribers.retain(|tx| tx.send(entries.clone()).is_ok());
    }
}

/// Everything the store knows about one room. Guarded as a unit so writes
/// and their notifications are ordered per room.
#[derive(Default)]
struct RoomSlot {
    doc: Option<Document>,
    subscribers: Vec<mpsc::UnboundedSender<Option<Document>>>,
    collections: HashMap<String, CollectionSlot>,
}

impl RoomSlot {
    /// Nothing stored and nobody listening.
    fn is_vacant(&self) -> bool {
        self.doc.is_none()
            && self.subscribers.iter().all(|tx| tx.is_closed())
            && self.collections.values().all(CollectionSlot::is_vacant)
    }

    fn notify(&mut self) {
        let doc = &self.doc;
        self.subscribers.retain(|tx| tx.send(doc.clone()).is_ok());
    }
}

/// In-process store. Each write is applied atomically under its room's lock
/// and fanned out to subscribers in commit order.
#[derive(Default)]
pub struct MemoryStore {
    rooms: Arc<DashMap<String, RoomSlot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the room's slot once it holds nothing and has no live
    /// subscribers.
    fn release_hook(&self, room_id: &str) -> impl FnOnce() + Send + Sync + 'static {
        let rooms: Weak<DashMap<String, RoomSlot>> = Arc::downgrade(&self.rooms);
        let room_id = room_id.to_string();
        move || {
            if let Some(rooms) = rooms.upgrade() {
                prune(&rooms, &room_id);
            }
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.iter().filter(|slot| slot.doc.is_some()).count()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn read(&self, room_id: &str) -> Result<Option<Document>> {
        Ok(self.rooms.get(room_id).and_then(|slot| slot.doc.clone()))
    }

    async fn subscribe(&self, room_id: &str) -> Result<Subscription<Option<Document>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = self.rooms.entry(room_id.to_string()).or_default();
        // Receiver is held locally, so the first send cannot fail.
        let _ = tx.send(slot.doc.clone());
        slot.subscribers.push(tx);
        Ok(Subscription::new(rx).with_drop_hook(self.release_hook(room_id)))
    }

    async fn write_full(&self, room_id: &str, doc: Document) -> Result<()> {
        let mut slot = self.rooms.entry(room_id.to_string()).or_default();
        slot.doc = Some(doc);
        slot.notify();
        tracing::debug!("write_full committed for room {}", room_id);
        Ok(())
    }

    async fn write_partial(&self, room_id: &str, fields: Document) -> Result<()> {
        let mut slot = self.rooms.entry(room_id.to_string()).or_default();
        let base = slot.doc.clone().unwrap_or_default();
        let next = apply_partial(&base, fields)?;
        slot.doc = Some(next);
        slot.notify();
        tracing::debug!("write_partial committed for room {}", room_id);
        Ok(())
    }

    async fn subcollection_add(&self, room_id: &str, subpath: &str, value: Value) -> Result<String> {
        // v7 keys sort by creation time, so listings follow join order.
        let key = Uuid::now_v7().simple().to_string();
        let mut slot = self.rooms.entry(room_id.to_string()).or_default();
        let collection = slot.collections.entry(subpath.to_string()).or_default();
        collection.entries.insert(key.clone(), value);
        collection.notify();
        Ok(key)
    }

    async fn subcollection_remove(&self, room_id: &str, subpath: &str, key: &str) -> Result<()> {
        if let Some(mut slot) = self.rooms.get_mut(room_id) {
            if let Some(collection) = slot.collections.get_mut(subpath) {
                if collection.entries.remove(key).is_some() {
                    collection.notify();
                }
            }
        }
        prune(&self.rooms, room_id);
        Ok(())
    }

    async fn subcollection_subscribe(
        &self,
        room_id: &str,
        subpath: &str,
    ) -> Result<Subscription<Collection>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = self.rooms.entry(room_id.to_string()).or_default();
        let collection = slot.collections.entry(subpath.to_string()).or_default();
        let _ = tx.send(collection.entries.clone());
        collection.subscribers.push(tx);
        Ok(Subscription::new(rx).with_drop_hook(self.release_hook(room_id)))
    }
}

fn prune(rooms: &DashMap<String, RoomSlot>, room_id: &str) {
    if rooms.remove_if(room_id, |_, slot| slot.is_vacant()).is_some() {
        tracing::debug!("Released empty room slot {}", room_id);
    }
}
