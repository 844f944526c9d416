//! heartgrid: a shared "find the hidden tile" room kept consistent over a
//! last-write-wins document store.
//!
//! # Architecture
//!
//! - **Lifecycle** ([`lifecycle`]): creates a room or attaches to one
//! - **Sync** ([`sync`]): per-client state machine and remote merge
//! - **Presence** ([`presence`]): owned membership entries
//! - **Session** ([`session`]): the async client driving all three
//! - **Store** ([`store`], [`memory`], [`remote`]): the shared document store
//!   capability, in-process or over the relay ([`server`], [`protocol`])

pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod presence;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod session;
pub mod store;
pub mod sync;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Settings;
pub use error::{Error, Result};
pub use lifecycle::{AttachMode, InitStrategy, Lifecycle};
pub use memory::MemoryStore;
pub use presence::Membership;
pub use remote::RemoteStore;
pub use session::{RoomView, Session};
pub use store::{SharedStore, Subscription};
pub use sync::{GameSync, merge_remote};
pub use types::{Phase, Player, Room, RoomId, RoomPatch, TOTAL_TILES};
