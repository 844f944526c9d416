//! The shared store capability the game synchronizes through.
//!
//! The store offers point reads, full and partial overwrites, change
//! notification and keyed sub-collections. It offers no compare-and-swap and
//! no transactions: everything built on top must converge under
//! last-write-wins.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::Document;

/// Entries of a sub-collection, ordered by key.
pub type Collection = BTreeMap<String, Value>;

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn read(&self, room_id: &str) -> Result<Option<Document>>;

    /// Yields the current document (`None` when absent) first, then the full
    /// document after every committed write.
    async fn subscribe(&self, room_id: &str) -> Result<Subscription<Option<Document>>>;

    async fn write_full(&self, room_id: &str, doc: Document) -> Result<()>;

    /// Overwrites only the named `/`-separated field paths. All paths apply
    /// or none do.
    async fn write_partial(&self, room_id: &str, fields: Document) -> Result<()>;

    /// Adds `value` under a fresh key and returns the key.
    async fn subcollection_add(&self, room_id: &str, subpath: &str, value: Value) -> Result<String>;

    async fn subcollection_remove(&self, room_id: &str, subpath: &str, key: &str) -> Result<()>;

    async fn subcollection_subscribe(
        &self,
        room_id: &str,
        subpath: &str,
    ) -> Result<Subscription<Collection>>;
}

/// A live feed of snapshots. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, on_drop: None }
    }

    /// Runs `f` once when the subscription is dropped.
    pub fn with_drop_hook(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_drop = Some(Box::new(f));
        self
    }

    /// Next snapshot, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns the most recent snapshot already delivered, skipping older
    /// ones, without waiting.
    pub fn latest(&mut self) -> Option<T> {
        let mut latest = None;
        while let Ok(item) = self.rx.try_recv() {
            latest = Some(item);
        }
        latest
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        // Senders must observe the closed channel when the hook runs.
        self.rx.close();
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

/// Applies one field-path overwrite to `doc`.
///
/// Intermediate segments must already exist: objects are indexed by key,
/// arrays by an in-bounds position. Only the final segment may be created.
pub fn apply_field_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalidPath(path.to_string()));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(Error::InvalidPath(path.to_string()));
    };

    let Some((first, middle)) = parents.split_first() else {
        doc.insert((*last).to_string(), value);
        return Ok(());
    };

    let mut node = doc
        .get_mut(*first)
        .ok_or_else(|| Error::InvalidPath(path.to_string()))?;
    for segment in middle {
        node = child_mut(node, segment, path)?;
    }

    match node {
        Value::Object(map) => {
            map.insert((*last).to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = parse_index(last, path)?;
            let slot = items
                .get_mut(idx)
                .ok_or_else(|| Error::InvalidPath(path.to_string()))?;
            *slot = value;
            Ok(())
        }
        _ => Err(Error::InvalidPath(path.to_string())),
    }
}

/// Applies every path of `fields` to a copy of `doc`, returning the copy only
/// if all of them applied.
pub fn apply_partial(doc: &Document, fields: Document) -> Result<Document> {
    let mut next = doc.clone();
    for (path, value) in fields {
        apply_field_path(&mut next, &path, value)?;
    }
    Ok(next)
}

fn child_mut<'a>(node: &'a mut Value, segment: &str, path: &str) -> Result<&'a mut Value> {
    match node {
        Value::Object(map) => map
            .get_mut(segment)
            .ok_or_else(|| Error::InvalidPath(path.to_string())),
        Value::Array(items) => {
            let idx = parse_index(segment, path)?;
            items
                .get_mut(idx)
                .ok_or_else(|| Error::InvalidPath(path.to_string()))
        }
        _ => Err(Error::InvalidPath(path.to_string())),
    }
}

fn parse_index(segment: &str, path: &str) -> Result<usize> {
    segment
        .parse::<usize>()
        .map_err(|_| Error::InvalidPath(path.to_string()))
}
