#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};

use heartgrid::store::Collection;
use heartgrid::types::{Document, FIELD_FINISHED};
use heartgrid::{
    AttachMode, Error, ManualClock, MemoryStore, Result, RoomId, Session, Settings, SharedStore,
    Subscription,
};

/// A finishing write parked until the test releases it.
pub struct HeldWrite {
    pub room_id: String,
    pub fields: Document,
    reply: oneshot::Sender<Result<()>>,
}

/// Wraps a [`MemoryStore`] so tests can hold finishing writes in flight and
/// choose the order the store applies them, or fail writes outright.
pub struct TestStore {
    pub inner: Arc<MemoryStore>,
    hold_finishes: AtomicBool,
    fail_writes: AtomicBool,
    held: Mutex<Vec<HeldWrite>>,
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(MemoryStore::new()),
            hold_finishes: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
        })
    }

    pub fn hold_finishes(&self, hold: bool) {
        self.hold_finishes.store(hold, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Waits until `count` finishing writes are parked.
    pub async fn wait_held(&self, count: usize) {
        for _ in 0..400 {
            if self.held.lock().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} held writes");
    }

    /// Applies the parked write at `index` (in arrival order) to the store.
    pub async fn release(&self, index: usize) -> Document {
        let write = self.held.lock().await.remove(index);
        let result = self
            .inner
            .write_partial(&write.room_id, write.fields.clone())
            .await;
        let _ = write.reply.send(result);
        write.fields
    }
}

#[async_trait]
impl SharedStore for TestStore {
    async fn read(&self, room_id: &str) -> Result<Option<Document>> {
        self.inner.read(room_id).await
    }

    async fn subscribe(&self, room_id: &str) -> Result<Subscription<Option<Document>>> {
        self.inner.subscribe(room_id).await
    }

    async fn write_full(&self, room_id: &str, doc: Document) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Transport("injected failure".into()));
        }
        self.inner.write_full(room_id, doc).await
    }

    async fn write_partial(&self, room_id: &str, fields: Document) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Transport("injected failure".into()));
        }
        if self.hold_finishes.load(Ordering::SeqCst) && fields.contains_key(FIELD_FINISHED) {
            let (reply, rx) = oneshot::channel();
            self.held.lock().await.push(HeldWrite {
                room_id: room_id.to_string(),
                fields,
                reply,
            });
            return rx.await.unwrap_or(Err(Error::Closed));
        }
        self.inner.write_partial(room_id, fields).await
    }

    async fn subcollection_add(&self, room_id: &str, subpath: &str, value: Value) -> Result<String> {
        self.inner.subcollection_add(room_id, subpath, value).await
    }

    async fn subcollection_remove(&self, room_id: &str, subpath: &str, key: &str) -> Result<()> {
        self.inner.subcollection_remove(room_id, subpath, key).await
    }

    async fn subcollection_subscribe(
        &self,
        room_id: &str,
        subpath: &str,
    ) -> Result<Subscription<Collection>> {
        self.inner.subcollection_subscribe(room_id, subpath).await
    }
}

pub fn settings() -> Settings {
    Settings {
        tick_millis: 20,
        ..Settings::default()
    }
}

pub async fn open(
    store: Arc<dyn SharedStore>,
    clock: &Arc<ManualClock>,
    room: &str,
    name: &str,
    mode: AttachMode,
) -> Result<Session> {
    Session::open(
        store,
        &settings(),
        clock.clone(),
        &RoomId::parse(room).unwrap(),
        name,
        mode,
    )
    .await
}

/// Some index other than `target`.
pub fn miss(target: usize, preferred: usize) -> usize {
    if preferred == target {
        (preferred + 1) % heartgrid::TOTAL_TILES
    } else {
        preferred
    }
}
