//! # relay-server
//!
//! Axum front end for the relay hub.
//!
//! - [`server`]: `RelayServer`, routes for `/ws/bot`, `/ws/worker`,
//!   `/ws/observer`, `/health` and `/metrics`
//! - [`session`]: socket write half as a frame sink and the per-connection
//!   read loop
//! - [`frames`]: what bot and worker frames turn into
//! - [`settings`]: defaults, JSON file and `RELAY_*` environment overrides
//! - [`shutdown`]: cancellation-token based graceful shutdown

#![deny(unsafe_code)]

pub mod errors;
pub mod frames;
pub mod health;
pub mod server;
pub mod session;
pub mod settings;
pub mod shutdown;

pub use errors::{HandshakeError, SettingsError};
pub use server::{AppState, RelayServer};
pub use settings::RelaySettings;
pub use shutdown::ShutdownCoordinator;
