//! Byte-stream transport abstraction and the default WebSocket
//! implementation. One transport message carries exactly one protocol
//! frame; framing within a message is the codec's job.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::prelude::*;

/// A connection is considered dead after this long without any inbound
/// message; the watchdog checks at a tenth of this period.
pub const MESSAGE_RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// One open byte-stream connection.
#[async_trait]
pub trait Socket: Send {
	async fn send(&mut self, data: Vec<u8>) -> WireResult<()>;

	/// The next binary frame; `None` once the peer closed the stream.
	async fn recv(&mut self) -> Option<WireResult<Vec<u8>>>;

	async fn close(&mut self);
}

/// Opens sockets for the provider. Swap this out to run the provider over
/// a different transport (tests use an in-memory pair).
#[async_trait]
pub trait SocketFactory: Send + Sync {
	async fn connect(&self, url: &str) -> WireResult<Box<dyn Socket>>;
}

/// Reconnect delay after `unsuccessful_reconnects` attempts that never
/// reached the connected state: `min(100 * 2^n, max_backoff)`.
pub fn backoff_delay(unsuccessful_reconnects: u32, max_backoff: Duration) -> Duration {
	let millis = 2u64
		.saturating_pow(unsuccessful_reconnects)
		.saturating_mul(100);
	Duration::from_millis(millis).min(max_backoff)
}

/// Default factory producing [`WsSocket`]s via tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsFactory;

#[async_trait]
impl SocketFactory for WsFactory {
	async fn connect(&self, url: &str) -> WireResult<Box<dyn Socket>> {
		let (stream, _response) = connect_async(url)
			.await
			.map_err(|err| Error::Network(err.to_string()))?;
		Ok(Box::new(WsSocket { stream }))
	}
}

pub struct WsSocket {
	stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for WsSocket {
	async fn send(&mut self, data: Vec<u8>) -> WireResult<()> {
		self.stream
			.send(Message::Binary(data.into()))
			.await
			.map_err(|err| Error::Network(err.to_string()))
	}

	async fn recv(&mut self) -> Option<WireResult<Vec<u8>>> {
		while let Some(message) = self.stream.next().await {
			match message {
				Ok(Message::Binary(data)) => return Some(Ok(data.into())),
				Ok(Message::Close(_)) => return None,
				// pings and pongs are handled by tungstenite, text frames
				// are not part of the protocol
				Ok(_) => continue,
				Err(err) => return Some(Err(Error::Network(err.to_string()))),
			}
		}
		None
	}

	async fn close(&mut self) {
		let _ = self.stream.close(None).await;
	}
}


// vim: ts=4
