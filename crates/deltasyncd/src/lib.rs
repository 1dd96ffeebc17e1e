//! deltasyncd: host hub and peer client for real-time project sync.
//!
//! A host runs the [`hub`] behind the [`server`] endpoint; peers connect
//! with [`client::PeerClient`]. Both sides only see the [`transport`]
//! traits, never a WebSocket type.

pub mod client;
pub mod hub;
pub mod server;
pub mod transport;

pub use client::PeerClient;
pub use hub::{Hub, HubSettings, PeerSummary};
pub use server::ServerState;
