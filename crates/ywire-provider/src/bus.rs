//! In-process broadcast bus.
//!
//! Providers in the same process that share a channel name (server URL +
//! room) fan frames out to each other without a server round-trip. Every
//! message carries the publisher's origin token so subscribers can skip
//! their own traffic.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::broadcast;

/// Opaque token distinguishing publishers on a shared channel.
pub type BusOrigin = u64;

/// Frames buffered per channel before slow subscribers start lagging.
const BUS_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct BusMessage {
	pub data: Arc<[u8]>,
	pub origin: BusOrigin,
}

/// Named broadcast channels multiplexed over tokio broadcast senders.
#[derive(Debug, Clone, Default)]
pub struct BroadcastBus {
	channels: Arc<Mutex<HashMap<Box<str>, broadcast::Sender<BusMessage>>>>,
}

impl BroadcastBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// The process-wide bus used by default. Providers created with their
	/// own bus instance are isolated from it (useful in tests).
	pub fn global() -> Self {
		static GLOBAL: LazyLock<BroadcastBus> = LazyLock::new(BroadcastBus::new);
		GLOBAL.clone()
	}

	/// Join a channel, creating it on first use. Dropping the receiver is
	/// the unsubscribe.
	pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage> {
		let mut channels = self.channels.lock();
		channels
			.entry(channel.into())
			.or_insert_with(|| broadcast::channel(BUS_BUFFER).0)
			.subscribe()
	}

	/// Publish to a channel. A channel nobody ever joined drops the frame.
	pub fn publish(&self, channel: &str, data: Vec<u8>, origin: BusOrigin) {
		let sender = self.channels.lock().get(channel).cloned();
		if let Some(sender) = sender {
			let _ = sender.send(BusMessage { data: data.into(), origin });
		}
	}

	/// Drop channels whose subscribers are all gone.
	pub fn cleanup(&self) {
		let mut channels = self.channels.lock();
		channels.retain(|_, sender| sender.receiver_count() > 0);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_publish_reaches_subscribers() {
		let bus = BroadcastBus::new();
		let mut rx = bus.subscribe("wss://relay.test/room");

		bus.publish("wss://relay.test/room", vec![1, 2, 3], 7);
		let msg = rx.recv().await.unwrap();
		assert_eq!(&*msg.data, &[1, 2, 3]);
		assert_eq!(msg.origin, 7);
	}

	#[tokio::test]
	async fn test_channels_are_isolated() {
		let bus = BroadcastBus::new();
		let mut rx = bus.subscribe("wss://relay.test/a");

		bus.publish("wss://relay.test/b", vec![1], 7);
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn test_publish_without_subscribers_is_a_noop() {
		let bus = BroadcastBus::new();
		bus.publish("wss://relay.test/empty", vec![1], 7);
	}

	#[tokio::test]
	async fn test_cleanup_drops_dead_channels() {
		let bus = BroadcastBus::new();
		let rx = bus.subscribe("wss://relay.test/room");
		drop(rx);
		bus.cleanup();
		assert!(bus.channels.lock().is_empty());
	}
}

// vim: ts=4
