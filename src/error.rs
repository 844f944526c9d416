//! Error types for heartgrid

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room {room_id} is full ({capacity} players)")]
    RoomFull { room_id: String, capacity: usize },

    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    #[error("Invalid display name: {0}")]
    InvalidName(String),

    #[error("Invalid field path: {0}")]
    InvalidPath(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for failures of the store connection rather than of the request.
    /// These are safe to retry by re-issuing the same action.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout | Self::Closed | Self::WebSocket(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
