//! Error handling subsystem. Implements a custom Error type shared by the
//! protocol and provider crates.

use std::fmt;

pub type WireResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	// Frame decoding
	/// A frame ended before the expected payload was fully read
	UnexpectedEof,
	/// A varint ran past the maximum encodable width
	VarIntOverflow,
	/// A var-string payload was not valid UTF-8
	InvalidUtf8,
	/// A payload failed JSON or CRDT decoding
	Decode(String),

	// Protocol state
	/// Awareness encode requested for a client with no known clock
	UnknownClient(u64),

	// Transport
	/// Connect, send or receive failure on the byte stream
	Network(String),
	/// The connection was closed by the peer
	ConnectionClosed,

	// System
	/// Internal invariant violations, for debugging
	Internal(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::UnexpectedEof => write!(f, "unexpected end of frame"),
			Error::VarIntOverflow => write!(f, "varint exceeds encodable range"),
			Error::InvalidUtf8 => write!(f, "var-string is not valid UTF-8"),
			Error::Decode(msg) => write!(f, "decode error: {}", msg),
			Error::UnknownClient(id) => write!(f, "no known clock for client {}", id),
			Error::Network(msg) => write!(f, "network error: {}", msg),
			Error::ConnectionClosed => write!(f, "connection closed"),
			Error::Internal(msg) => write!(f, "internal error: {}", msg),
		}
	}
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Decode(err.to_string())
	}
}

impl From<std::string::FromUtf8Error> for Error {
	fn from(_err: std::string::FromUtf8Error) -> Self {
		Error::InvalidUtf8
	}
}

// vim: ts=4
