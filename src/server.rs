//! WebSocket relay exposing a [`MemoryStore`] to remote clients.
//!
//! The relay forwards store operations verbatim. It does not validate game
//! state, order turns or pick winners.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use futures::stream::{self, AbortHandle, BoxStream, SelectAll, SplitSink};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::protocol::{ClientMsg, ServerMsg};
use crate::store::{SharedStore, Subscription};
use crate::types::RoomId;

#[derive(Clone)]
struct AppState {
    store: Arc<MemoryStore>,
}

pub fn router(store: Arc<MemoryStore>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms/{room_id}", get(room_document))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(AppState { store })
}

/// Serves the relay until the listener fails.
pub async fn serve(listener: TcpListener, store: Arc<MemoryStore>) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("heartgrid relay listening on {}", addr);
    axum::serve(listener, router(store)).await?;
    Ok(())
}

// ─── Routes ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": state.store.room_count(),
    }))
}

async fn room_document(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Ok(room_id) = RoomId::parse(&room_id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match state.store.read(room_id.as_str()).await {
        Ok(Some(doc)) => Json(doc).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Subscriptions held by one socket, merged into a single stream of pushes.
#[derive(Default)]
struct Feeds {
    pushes: SelectAll<BoxStream<'static, ServerMsg>>,
    handles: HashMap<u64, AbortHandle>,
}

impl Feeds {
    fn insert<T: Send + 'static>(
        &mut self,
        sub: u64,
        feed: Subscription<T>,
        push: fn(u64, T) -> ServerMsg,
    ) {
        let items = stream::unfold(feed, |mut feed| async move {
            let item = feed.next().await?;
            Some((item, feed))
        })
        .map(move |item| push(sub, item));
        let (items, handle) = stream::abortable(items);
        self.pushes.push(items.boxed());
        if let Some(old) = self.handles.insert(sub, handle) {
            old.abort();
        }
    }

    fn remove(&mut self, sub: u64) {
        if let Some(handle) = self.handles.remove(&sub) {
            handle.abort();
        }
    }

    /// Pushes already queued by the store, without waiting for more.
    fn ready(&mut self) -> Vec<ServerMsg> {
        let mut ready = Vec::new();
        while let Some(Some(msg)) = self.pushes.next().now_or_never() {
            ready.push(msg);
        }
        ready
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let socket_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("WebSocket connected: {}", socket_id);

    let mut feeds = Feeds::default();

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let Some(Ok(msg)) = frame else { break };
                let Message::Text(text) = msg else { continue };

                let reply = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(client_msg) => handle_message(&state, &mut feeds, client_msg).await,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", socket_id, e);
                        Some(ServerMsg::error(None, &Error::from(e)))
                    }
                };

                // Snapshots of writes committed so far precede the response,
                // so an acknowledged write is never followed by an older one.
                if !send_all(&mut sender, feeds.ready()).await {
                    break;
                }
                if let Some(reply) = reply {
                    if !send_msg(&mut sender, &reply).await {
                        break;
                    }
                }
            }
            Some(push) = feeds.pushes.next(), if !feeds.pushes.is_empty() => {
                if !send_msg(&mut sender, &push).await {
                    break;
                }
            }
        }
    }

    // Socket disconnected; dropping the feeds ends every subscription.
    tracing::info!("WebSocket disconnected: {}", socket_id);
}

async fn handle_message(state: &AppState, feeds: &mut Feeds, msg: ClientMsg) -> Option<ServerMsg> {
    let store = &state.store;

    let reply = match msg {
        ClientMsg::Read { req, room_id } => respond(req, async {
            let room_id = RoomId::parse(&room_id)?;
            let doc = store.read(room_id.as_str()).await?;
            Ok(ServerMsg::Document { req, doc })
        })
        .await,

        ClientMsg::Subscribe { req, room_id } => respond(req, async {
            let room_id = RoomId::parse(&room_id)?;
            let feed = store.subscribe(room_id.as_str()).await?;
            feeds.insert(req, feed, |sub, doc| ServerMsg::Snapshot { sub, doc });
            Ok(ServerMsg::Ack { req })
        })
        .await,

        ClientMsg::Unsubscribe { sub } => {
            feeds.remove(sub);
            return None;
        }

        ClientMsg::WriteFull { req, room_id, doc } => respond(req, async {
            let room_id = RoomId::parse(&room_id)?;
            store.write_full(room_id.as_str(), doc).await?;
            Ok(ServerMsg::Ack { req })
        })
        .await,

        ClientMsg::WritePartial { req, room_id, fields } => respond(req, async {
            let room_id = RoomId::parse(&room_id)?;
            store.write_partial(room_id.as_str(), fields).await?;
            Ok(ServerMsg::Ack { req })
        })
        .await,

        ClientMsg::CollectionAdd {
            req,
            room_id,
            subpath,
            value,
        } => respond(req, async {
            let room_id = RoomId::parse(&room_id)?;
            let key = store.subcollection_add(room_id.as_str(), &subpath, value).await?;
            Ok(ServerMsg::Key { req, key })
        })
        .await,

        ClientMsg::CollectionRemove {
            req,
            room_id,
            subpath,
            key,
        } => respond(req, async {
            let room_id = RoomId::parse(&room_id)?;
            store
                .subcollection_remove(room_id.as_str(), &subpath, &key)
                .await?;
            Ok(ServerMsg::Ack { req })
        })
        .await,

        ClientMsg::CollectionSubscribe {
            req,
            room_id,
            subpath,
        } => respond(req, async {
            let room_id = RoomId::parse(&room_id)?;
            let feed = store
                .subcollection_subscribe(room_id.as_str(), &subpath)
                .await?;
            feeds.insert(req, feed, |sub, entries| ServerMsg::Collection { sub, entries });
            Ok(ServerMsg::Ack { req })
        })
        .await,
    };

    Some(reply)
}

async fn respond(req: u64, fut: impl Future<Output = Result<ServerMsg>>) -> ServerMsg {
    match fut.await {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("Request {} failed: {}", req, e);
            ServerMsg::error(Some(req), &e)
        }
    }
}

/// Returns false once the socket is gone.
async fn send_msg(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> bool {
    let Ok(json) = serde_json::to_string(msg) else {
        return true;
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

async fn send_all(sender: &mut SplitSink<WebSocket, Message>, msgs: Vec<ServerMsg>) -> bool {
    for msg in &msgs {
        if !send_msg(sender, msg).await {
            return false;
        }
    }
    true
}
