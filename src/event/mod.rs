//! Event identity and wire format.

pub mod codec;
pub mod id;
pub mod payload;

pub use codec::{
    decode, encode, encode_at, EventKind, EventName, IgnoreAction, KindTag, LinkAction,
    MonitorAction, TakeAction,
};
pub use id::{ActorHash, ItemId};
pub use payload::{EventPayload, PayloadState};
