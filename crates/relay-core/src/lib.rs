//! # relay-core
//!
//! Dialect-neutral message model and the protocol codec shared by the hub and
//! the server.
//!
//! - [`message`]: `CanonicalMessage` tagged union, typed segments, bounded extension bag
//! - [`action`]: `{action, params, echo}` command envelopes and their responses
//! - [`codec`]: translation between the canonical model and both wire dialects
//! - [`ids`]: branded identifiers and correlation tokens

#![deny(unsafe_code)]

pub mod action;
pub mod codec;
pub mod ids;
pub mod message;

pub use action::{ActionRequest, ActionResponse};
pub use codec::{CodecError, Dialect};
pub use ids::{CorrelationToken, ObserverId};
pub use message::{
    CanonicalMessage, Envelope, EventBody, EventKind, Extensions, MessageEvent, MessageType,
    MetaEvent, NoticeEvent, ResponseEvent, Segment, SegmentKind, Sender,
};
