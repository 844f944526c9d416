//! One connected client.
//!
//! A session attaches to a room, joins its presence list and then runs a
//! single task that serializes everything the client does: local commands,
//! remote room snapshots, membership snapshots and the elapsed-time ticker.
//! The latest view is published on a watch channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::lifecycle::{AttachMode, Lifecycle, random_target};
use crate::presence::{self, Membership};
use crate::store::{Collection, SharedStore, Subscription};
use crate::sync::GameSync;
use crate::types::{Document, Phase, Player, Room, RoomId, RoomPatch, format_elapsed};

/// Commands a caller sends to its session task.
#[derive(Debug)]
pub enum SessionCommand {
    Reveal {
        index: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Reset {
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// What the client currently believes about its room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    pub room_id: RoomId,
    pub player_key: String,
    pub display_name: String,
    pub phase: Phase,
    pub room: Option<Room>,
    pub players: Vec<Player>,
}

impl RoomView {
    pub fn is_finished(&self) -> bool {
        self.room.as_ref().is_some_and(|r| r.finished)
    }

    pub fn winner(&self) -> Option<&str> {
        self.room.as_ref().and_then(|r| r.winner.as_deref())
    }
}

pub struct Session {
    room_id: RoomId,
    player_key: String,
    cmd_tx: mpsc::Sender<SessionCommand>,
    view_rx: watch::Receiver<RoomView>,
    task: JoinHandle<()>,
}

impl Session {
    /// Attaches to `room_id`, joins it as `display_name` and starts the
    /// session task.
    pub async fn open(
        store: Arc<dyn SharedStore>,
        settings: &Settings,
        clock: Arc<dyn Clock>,
        room_id: &RoomId,
        display_name: &str,
        mode: AttachMode,
    ) -> Result<Self> {
        let display_name = presence::validate_name(display_name)?;

        let lifecycle = Lifecycle::new(store.clone(), settings, clock.clone());
        let room = lifecycle.attach(room_id, mode).await?;

        let room_feed = store.subscribe(room_id.as_str()).await?;
        let membership = presence::join(store.clone(), room_id, &display_name).await?;
        let player_feed = presence::watch(store.as_ref(), room_id).await?;

        let mut sync = GameSync::new(display_name.clone());
        sync.adopt(room);

        let player_key = membership.key().to_string();
        let initial = RoomView {
            room_id: room_id.clone(),
            player_key: player_key.clone(),
            display_name,
            phase: sync.phase(),
            room: sync.room().cloned(),
            players: Vec::new(),
        };
        let (view_tx, view_rx) = watch::channel(initial);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let state = SessionState {
            store,
            clock,
            room_id: room_id.clone(),
            sync,
            membership: Some(membership),
            players: Vec::new(),
            view_tx,
        };
        let tick = Duration::from_millis(settings.tick_millis.max(1));
        let task = tokio::spawn(session_task(state, cmd_rx, room_feed, player_feed, tick));

        Ok(Self {
            room_id: room_id.clone(),
            player_key,
            cmd_tx,
            view_rx,
            task,
        })
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn player_key(&self) -> &str {
        &self.player_key
    }

    pub fn view(&self) -> RoomView {
        self.view_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RoomView> {
        self.view_rx.clone()
    }

    /// Waits until the view satisfies `pred`.
    pub async fn wait_until(&self, pred: impl FnMut(&RoomView) -> bool) -> Result<RoomView> {
        let mut rx = self.view_rx.clone();
        let view = rx.wait_for(pred).await.map_err(|_| Error::Closed)?;
        Ok(view.clone())
    }

    /// Reveals a cell. Illegal reveals succeed as no-ops; an error means the
    /// write did not reach the store and the same call may be retried.
    pub async fn reveal(&self, index: usize) -> Result<()> {
        self.request(|reply| SessionCommand::Reveal { index, reply }).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Reset { reply }).await
    }

    /// Removes this client's presence entry and stops the session.
    pub async fn leave(self) -> Result<()> {
        let result = self.request(|reply| SessionCommand::Leave { reply }).await;
        let _ = self.task.await;
        result
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> SessionCommand,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(make(reply)).await.map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

/// State owned by the session task.
struct SessionState {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    room_id: RoomId,
    sync: GameSync,
    membership: Option<Membership>,
    players: Vec<Player>,
    view_tx: watch::Sender<RoomView>,
}

impl SessionState {
    fn publish_view(&self) {
        self.view_tx.send_modify(|view| {
            view.phase = self.sync.phase();
            view.room = self.sync.room().cloned();
            view.players = self.players.clone();
        });
    }

    async fn write(&self, patch: RoomPatch) -> Result<()> {
        let result = self
            .store
            .write_partial(self.room_id.as_str(), patch.into_fields())
            .await;
        if let Err(e) = &result {
            tracing::warn!("Write to room {} failed: {}", self.room_id, e);
        }
        result
    }

    /// Publishes a local action, undoing it locally if the store never got it.
    async fn commit(&mut self, before: Option<Room>, patch: RoomPatch) -> Result<()> {
        self.publish_view();
        let result = self.write(patch).await;
        if result.is_err() {
            if let Some(room) = before {
                self.sync.restore(room);
                self.publish_view();
            }
        }
        result
    }

    async fn reveal(&mut self, index: usize) -> Result<()> {
        let before = self.sync.room().cloned();
        let Some(patch) = self.sync.reveal(index, self.clock.now_ms()) else {
            return Ok(());
        };

        if let Some(room) = self.sync.room().filter(|r| r.finished) {
            tracing::info!(
                "{} found the target in room {} after {}",
                self.sync.player(),
                self.room_id,
                format_elapsed(room.elapsed)
            );
        }
        self.commit(before, patch).await
    }

    async fn reset(&mut self) -> Result<()> {
        let before = self.sync.room().cloned();
        let Some(patch) = self.sync.reset(random_target(), self.clock.now_ms()) else {
            return Ok(());
        };
        tracing::info!("{} reset room {}", self.sync.player(), self.room_id);
        self.commit(before, patch).await
    }

    async fn tick(&mut self) {
        if let Some(patch) = self.sync.tick(self.clock.now_ms()) {
            self.publish_view();
            // Advisory telemetry; the next tick supersedes a failed one.
            let _ = self.write(patch).await;
        }
    }

    fn on_room(&mut self, doc: Option<&Document>) {
        if self.sync.apply_remote(doc) {
            tracing::debug!("Room {} reconciled ({})", self.room_id, self.sync.phase());
        }
        self.publish_view();
    }

    fn on_players(&mut self, collection: &Collection) {
        self.players = presence::players_from(collection);
        self.publish_view();
    }

    async fn leave(&mut self) -> Result<()> {
        match self.membership.take() {
            Some(membership) => membership.leave().await,
            None => Ok(()),
        }
    }
}

async fn session_task(
    mut state: SessionState,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    mut room_feed: Subscription<Option<Document>>,
    mut player_feed: Subscription<Collection>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;

    let mut room_open = true;
    let mut players_open = true;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Reveal { index, reply }) => {
                    let _ = reply.send(state.reveal(index).await);
                }
                Some(SessionCommand::Reset { reply }) => {
                    let _ = reply.send(state.reset().await);
                }
                Some(SessionCommand::Leave { reply }) => {
                    let _ = reply.send(state.leave().await);
                    return;
                }
                // Every handle is gone.
                None => break,
            },
            snapshot = room_feed.next(), if room_open => match snapshot {
                Some(doc) => {
                    // Skip to the newest queued snapshot; older ones predate
                    // writes this client already applied locally.
                    let doc = room_feed.latest().unwrap_or(doc);
                    state.on_room(doc.as_ref());
                }
                None => {
                    tracing::warn!("Room feed for {} closed", state.room_id);
                    room_open = false;
                }
            },
            snapshot = player_feed.next(), if players_open => match snapshot {
                Some(collection) => state.on_players(&collection),
                None => {
                    tracing::warn!("Player feed for {} closed", state.room_id);
                    players_open = false;
                }
            },
            _ = ticker.tick(), if state.sync.timer_running() => {
                state.tick().await;
            }
        }
    }

    let _ = state.leave().await;
}
