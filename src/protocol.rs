use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::store::Collection;
use crate::types::Document;

/// Messages sent from clients to the relay via WebSocket.
///
/// Every request carries a client-chosen `req` id echoed in its response.
/// Subscriptions are identified by the `req` of the request that opened them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    Read {
        req: u64,
        room_id: String,
    },
    Subscribe {
        req: u64,
        room_id: String,
    },
    Unsubscribe {
        sub: u64,
    },
    WriteFull {
        req: u64,
        room_id: String,
        doc: Document,
    },
    WritePartial {
        req: u64,
        room_id: String,
        fields: Document,
    },
    CollectionAdd {
        req: u64,
        room_id: String,
        subpath: String,
        value: Value,
    },
    CollectionRemove {
        req: u64,
        room_id: String,
        subpath: String,
        key: String,
    },
    CollectionSubscribe {
        req: u64,
        room_id: String,
        subpath: String,
    },
}

/// Messages sent from the relay to clients via WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMsg {
    // Responses
    Ack {
        req: u64,
    },
    Document {
        req: u64,
        doc: Option<Document>,
    },
    Key {
        req: u64,
        key: String,
    },
    Error {
        req: Option<u64>,
        kind: ErrorKind,
        message: String,
    },

    // Subscription pushes
    Snapshot {
        sub: u64,
        doc: Option<Document>,
    },
    Collection {
        sub: u64,
        entries: Collection,
    },
}

impl ServerMsg {
    /// The request this message answers, if it is a response.
    pub fn req(&self) -> Option<u64> {
        match self {
            Self::Ack { req } | Self::Document { req, .. } | Self::Key { req, .. } => Some(*req),
            Self::Error { req, .. } => *req,
            Self::Snapshot { .. } | Self::Collection { .. } => None,
        }
    }

    pub fn error(req: Option<u64>, err: &Error) -> Self {
        Self::Error {
            req,
            kind: ErrorKind::from(err),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRoomId,
    InvalidPath,
    BadRequest,
    Internal,
}

impl From<&Error> for ErrorKind {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidRoomId(_) => Self::InvalidRoomId,
            Error::InvalidPath(_) => Self::InvalidPath,
            Error::Serialization(_) => Self::BadRequest,
            _ => Self::Internal,
        }
    }
}

impl ErrorKind {
    /// Rebuilds a client-side error from a relay error response.
    pub fn into_error(self, message: String) -> Error {
        match self {
            Self::InvalidRoomId => Error::InvalidRoomId(message),
            Self::InvalidPath => Error::InvalidPath(message),
            Self::BadRequest | Self::Internal => Error::Transport(message),
        }
    }
}
