//! Wire protocol primitives for Yjs-compatible collaboration.
//!
//! Everything in this crate is transport-agnostic: the lib0 frame codec,
//! the y-sync handshake messages, the auth frames, and the awareness state
//! engine. The companion `ywire-provider` crate owns sockets, timers and
//! fan-out; this crate owns bytes and state.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

mod prelude;

pub mod auth;
pub mod awareness;
pub mod codec;
pub mod error;
pub mod sync;

pub use awareness::{Awareness, AwarenessEvent, ClientId, UpdateOrigin, OUTDATED_TIMEOUT};
pub use codec::{Decoder, Encoder};
pub use error::{Error, WireResult};

// vim: ts=4
