//! Reconnecting sync provider for Yjs-compatible documents.
//!
//! A [`Provider`] binds one `yrs` document and one room name to a relay
//! endpoint. It keeps the document and an awareness map converged with the
//! relay over a reconnecting WebSocket, and with other providers in the
//! same process over a named broadcast bus, so co-located peers converge
//! without a server round-trip.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

mod prelude;

pub mod bus;
pub mod provider;
pub mod transport;

pub use bus::BroadcastBus;
pub use provider::{ConnectionStatus, Provider, ProviderEvent, ProviderOptions};
pub use transport::{Socket, SocketFactory, WsFactory};
pub use ywire_protocol::{Awareness, Error, WireResult};

// vim: ts=4
