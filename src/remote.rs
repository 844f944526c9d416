//! [`SharedStore`] over the relay's WebSocket protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};
use crate::protocol::{ClientMsg, ServerMsg};
use crate::store::{Collection, SharedStore, Subscription};
use crate::types::Document;

/// Connection state shared by the store handle and its reader task.
struct Inner {
    out_tx: mpsc::UnboundedSender<ClientMsg>,
    next_req: AtomicU64,
    /// req -> waiting caller
    pending: DashMap<u64, oneshot::Sender<ServerMsg>>,
    /// sub -> document subscriber
    doc_subs: DashMap<u64, mpsc::UnboundedSender<Option<Document>>>,
    /// sub -> collection subscriber
    collection_subs: DashMap<u64, mpsc::UnboundedSender<Collection>>,
    timeout: Duration,
}

impl Inner {
    fn next_req(&self) -> u64 {
        self.next_req.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch(&self, text: &str) {
        let msg: ServerMsg = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid message from relay: {}", e);
                return;
            }
        };

        match msg {
            ServerMsg::Snapshot { sub, doc } => {
                let closed = match self.doc_subs.get(&sub) {
                    Some(tx) => tx.send(doc).is_err(),
                    None => false,
                };
                if closed {
                    self.doc_subs.remove(&sub);
                }
            }
            ServerMsg::Collection { sub, entries } => {
                let closed = match self.collection_subs.get(&sub) {
                    Some(tx) => tx.send(entries).is_err(),
                    None => false,
                };
                if closed {
                    self.collection_subs.remove(&sub);
                }
            }
            response => match response.req() {
                Some(req) => {
                    if let Some((_, waiter)) = self.pending.remove(&req) {
                        let _ = waiter.send(response);
                    }
                }
                None => tracing::warn!("Relay reported an error: {:?}", response),
            },
        }
    }

    /// Fails every waiting request and ends every subscription.
    fn shutdown(&self) {
        self.pending.clear();
        self.doc_subs.clear();
        self.collection_subs.clear();
    }
}

pub struct RemoteStore {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteStore {
    /// Connects to a relay at `url` (e.g. `ws://localhost:3000/ws`).
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let (ws, _) = connect_async(url).await?;
        let (mut sink, mut stream) = ws.split();
        tracing::info!("Connected to relay {}", url);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMsg>();
        let inner = Arc::new(Inner {
            out_tx,
            next_req: AtomicU64::new(1),
            pending: DashMap::new(),
            doc_subs: DashMap::new(),
            collection_subs: DashMap::new(),
            timeout,
        });

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Failed to encode request: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_inner = inner.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader_inner.dispatch(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("Relay connection failed: {}", e);
                        break;
                    }
                }
            }
            tracing::info!("Relay connection closed");
            reader_inner.shutdown();
        });

        Ok(Self {
            inner,
            tasks: vec![writer, reader],
        })
    }

    async fn call(&self, req: u64, msg: ClientMsg) -> Result<ServerMsg> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(req, tx);
        if self.inner.out_tx.send(msg).is_err() {
            self.inner.pending.remove(&req);
            return Err(Error::Closed);
        }

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(ServerMsg::Error { kind, message, .. })) => Err(kind.into_error(message)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.inner.pending.remove(&req);
                Err(Error::Timeout)
            }
        }
    }

    async fn expect_ack(&self, req: u64, msg: ClientMsg) -> Result<()> {
        match self.call(req, msg).await? {
            ServerMsg::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn unsubscribe_hook(&self, sub: u64) -> impl FnOnce() + Send + Sync + 'static {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = inner.upgrade() {
                inner.doc_subs.remove(&sub);
                inner.collection_subs.remove(&sub);
                let _ = inner.out_tx.send(ClientMsg::Unsubscribe { sub });
            }
        }
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.inner.shutdown();
    }
}

fn unexpected(msg: &ServerMsg) -> Error {
    Error::Transport(format!("unexpected response: {msg:?}"))
}

#[async_trait]
impl SharedStore for RemoteStore {
    async fn read(&self, room_id: &str) -> Result<Option<Document>> {
        let req = self.inner.next_req();
        let msg = ClientMsg::Read {
            req,
            room_id: room_id.to_string(),
        };
        match self.call(req, msg).await? {
            ServerMsg::Document { doc, .. } => Ok(doc),
            other => Err(unexpected(&other)),
        }
    }

    async fn subscribe(&self, room_id: &str) -> Result<Subscription<Option<Document>>> {
        let req = self.inner.next_req();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.doc_subs.insert(req, tx);

        let msg = ClientMsg::Subscribe {
            req,
            room_id: room_id.to_string(),
        };
        if let Err(e) = self.expect_ack(req, msg).await {
            self.inner.doc_subs.remove(&req);
            return Err(e);
        }
        Ok(Subscription::new(rx).with_drop_hook(self.unsubscribe_hook(req)))
    }

    async fn write_full(&self, room_id: &str, doc: Document) -> Result<()> {
        let req = self.inner.next_req();
        let msg = ClientMsg::WriteFull {
            req,
            room_id: room_id.to_string(),
            doc,
        };
        self.expect_ack(req, msg).await
    }

    async fn write_partial(&self, room_id: &str, fields: Document) -> Result<()> {
        let req = self.inner.next_req();
        let msg = ClientMsg::WritePartial {
            req,
            room_id: room_id.to_string(),
            fields,
        };
        self.expect_ack(req, msg).await
    }

    async fn subcollection_add(&self, room_id: &str, subpath: &str, value: Value) -> Result<String> {
        let req = self.inner.next_req();
        let msg = ClientMsg::CollectionAdd {
            req,
            room_id: room_id.to_string(),
            subpath: subpath.to_string(),
            value,
        };
        match self.call(req, msg).await? {
            ServerMsg::Key { key, .. } => Ok(key),
            other => Err(unexpected(&other)),
        }
    }

    async fn subcollection_remove(&self, room_id: &str, subpath: &str, key: &str) -> Result<()> {
        let req = self.inner.next_req();
        let msg = ClientMsg::CollectionRemove {
            req,
            room_id: room_id.to_string(),
            subpath: subpath.to_string(),
            key: key.to_string(),
        };
        self.expect_ack(req, msg).await
    }

    async fn subcollection_subscribe(
        &self,
        room_id: &str,
        subpath: &str,
    ) -> Result<Subscription<Collection>> {
        let req = self.inner.next_req();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.collection_subs.insert(req, tx);

        let msg = ClientMsg::CollectionSubscribe {
            req,
            room_id: room_id.to_string(),
            subpath: subpath.to_string(),
        };
        if let Err(e) = self.expect_ack(req, msg).await {
            self.inner.collection_subs.remove(&req);
            return Err(e);
        }
        Ok(Subscription::new(rx).with_drop_hook(self.unsubscribe_hook(req)))
    }
}
