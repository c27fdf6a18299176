//! # relay-hub
//!
//! Core of the relay: who is connected, where traffic goes, and how replies
//! find their callers.
//!
//! - [`registry`]: one live connection per (role, id), replacement on re-register
//! - [`liveness`]: periodic eviction of silent bots and workers
//! - [`rules`] and [`router`]: rule-first, round-robin worker selection
//! - [`correlation`]: token → one-shot reply slot with drop-guard cleanup
//! - [`broadcast`]: event fan-out to observers
//! - [`hub`]: the [`Hub`] facade tying the pieces together

#![deny(unsafe_code)]

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod errors;
pub mod events;
pub mod hub;
pub mod liveness;
pub mod registry;
pub mod router;
pub mod rules;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::HubConfig;
pub use connection::{Capability, Connection, ConnectionInfo, ConnectionKind, FrameSink};
pub use errors::{HubError, TransportError};
pub use events::{DisconnectReason, DisconnectRecord, HubEvent};
pub use hub::{Hub, HubStats};
pub use rules::{MemoryRuleStore, RoutingRule, RoutingRuleStore, RoutingTable};
