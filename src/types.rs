use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};

pub const GRID_COLS: usize = 5;
pub const GRID_ROWS: usize = 5;
pub const TOTAL_TILES: usize = GRID_COLS * GRID_ROWS;

/// Sub-collection holding presence entries.
pub const PLAYERS_PATH: &str = "players";

pub const FIELD_TARGET_INDEX: &str = "targetIndex";
pub const FIELD_REVEALED: &str = "revealed";
pub const FIELD_FINISHED: &str = "finished";
pub const FIELD_WINNER: &str = "winner";
pub const FIELD_EPOCH_START: &str = "epochStart";
pub const FIELD_ELAPSED: &str = "elapsed";
pub const FIELD_EPOCH: &str = "epoch";

/// A mapping-valued document as held by the shared store.
pub type Document = serde_json::Map<String, Value>;

/// The shared room document, one per room id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub target_index: usize,
    pub revealed: Vec<bool>,
    pub finished: bool,
    pub winner: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub epoch_start: i64,
    /// Advisory, milliseconds.
    pub elapsed: i64,
    pub epoch: u64,
}

impl Room {
    /// Fresh first epoch.
    pub fn initial(target_index: usize, now_ms: i64) -> Self {
        Self {
            target_index,
            revealed: vec![false; TOTAL_TILES],
            finished: false,
            winner: None,
            epoch_start: now_ms,
            elapsed: 0,
            epoch: 1,
        }
    }

    pub fn is_revealed(&self, index: usize) -> bool {
        self.revealed.get(index).copied().unwrap_or(false)
    }

    pub fn revealed_count(&self) -> usize {
        self.revealed.iter().filter(|r| **r).count()
    }

    /// Grid-sized `revealed` and an on-grid target.
    pub fn is_well_formed(&self) -> bool {
        self.revealed.len() == TOTAL_TILES && self.target_index < TOTAL_TILES
    }

    /// `finished` implies the target is revealed and a winner is recorded.
    pub fn is_consistent(&self) -> bool {
        !self.finished || (self.is_revealed(self.target_index) && self.winner.is_some())
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(FIELD_TARGET_INDEX.into(), json!(self.target_index));
        doc.insert(FIELD_REVEALED.into(), json!(self.revealed));
        doc.insert(FIELD_FINISHED.into(), json!(self.finished));
        doc.insert(FIELD_WINNER.into(), json!(self.winner));
        doc.insert(FIELD_EPOCH_START.into(), json!(self.epoch_start));
        doc.insert(FIELD_ELAPSED.into(), json!(self.elapsed));
        doc.insert(FIELD_EPOCH.into(), json!(self.epoch));
        doc
    }
}

/// A set of field-path overwrites destined for one partial write.
///
/// Every entry is a whole, independently valid field so the document is never
/// left half-typed if a later write fails.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomPatch {
    fields: Document,
}

impl RoomPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set-true flip of a single cell.
    pub fn reveal(mut self, index: usize) -> Self {
        self.fields
            .insert(format!("{FIELD_REVEALED}/{index}"), Value::Bool(true));
        self
    }

    pub fn finish(mut self, winner: &str, elapsed: i64) -> Self {
        self.fields.insert(FIELD_FINISHED.into(), Value::Bool(true));
        self.fields.insert(FIELD_WINNER.into(), json!(winner));
        self.fields.insert(FIELD_ELAPSED.into(), json!(elapsed));
        self
    }

    pub fn elapsed(mut self, elapsed: i64) -> Self {
        self.fields.insert(FIELD_ELAPSED.into(), json!(elapsed));
        self
    }

    /// Every game field of `room`, for replacing a whole epoch in one write.
    pub fn epoch(mut self, room: &Room) -> Self {
        self.fields.extend(room.to_document());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &Document {
        &self.fields
    }

    pub fn into_fields(self) -> Document {
        self.fields
    }
}

/// A presence entry in the room's `players` sub-collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    #[serde(default)]
    pub player_key: String,
    pub display_name: String,
}

pub const ROOM_ID_MAX_LEN: usize = 64;
const NEW_ROOM_ID_LEN: usize = 6;
const NEW_ROOM_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Client-chosen room id, used verbatim as the store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidRoomId("room id cannot be empty".to_string()));
        }
        if trimmed.len() > ROOM_ID_MAX_LEN {
            return Err(Error::InvalidRoomId(format!(
                "room id cannot exceed {ROOM_ID_MAX_LEN} characters"
            )));
        }
        if let Some(ch) = trimmed
            .chars()
            .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_'))
        {
            return Err(Error::InvalidRoomId(format!("invalid character '{ch}'")));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// A fresh short id for a newly created room.
    pub fn generate() -> Self {
        use rand::Rng;

        let mut rng = rand::rng();
        let id = (0..NEW_ROOM_ID_LEN)
            .map(|_| {
                let idx = rng.random_range(0..NEW_ROOM_ID_ALPHABET.len());
                char::from(NEW_ROOM_ID_ALPHABET[idx])
            })
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RoomId {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

/// Synchronizer state as seen by one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Uninitialized,
    Syncing,
    Idle,
    Resolved,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "UNINITIALIZED"),
            Self::Syncing => write!(f, "SYNCING"),
            Self::Idle => write!(f, "IDLE"),
            Self::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// Renders a duration in milliseconds as `MM:SS`.
pub fn format_elapsed(ms: i64) -> String {
    let ms = ms.max(0);
    let seconds = (ms / 1000) % 60;
    let minutes = (ms / (1000 * 60)) % 60;
    format!("{minutes:02}:{seconds:02}")
}
