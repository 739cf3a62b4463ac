//! The provider: glue between one document, one room and one relay.
//!
//! Incoming frames are routed to the sync, awareness or auth handlers and
//! any reply goes back on the channel the frame arrived on. Local document
//! and awareness changes fan out to both the transport and the bus. The
//! transport reconnects with exponential backoff and a liveness watchdog.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use yrs::{Doc, Origin, Subscription};

use ywire_protocol::awareness::{AwarenessEvent, ClientId, UpdateOrigin};
use ywire_protocol::codec::{self, Decoder, Encoder};
use ywire_protocol::sync::{self, SyncMessage};
use ywire_protocol::{Awareness, OUTDATED_TIMEOUT, auth};

use crate::bus::{BroadcastBus, BusMessage, BusOrigin};
use crate::prelude::*;
use crate::transport::{
	MESSAGE_RECONNECT_TIMEOUT, Socket, SocketFactory, WsFactory, backoff_delay,
};

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
	Disconnected,
	Connecting,
	Connected,
}

/// Everything a provider reports to the application.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
	/// The transport changed state
	Status(ConnectionStatus),
	/// The initial handshake completed (`true`) or was reset (`false`)
	Sync(bool),
	/// Fires once per connection epoch when `synced` flips to `true`
	Synced(bool),
	/// A transport attempt or an open socket failed
	ConnectionError(String),
	/// The socket closed, with the failure reason if there was one
	ConnectionClose(Option<String>),
}

pub type PermissionDeniedHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ProviderOptions {
	/// Open the transport immediately on construction
	pub connect_on_launch: bool,
	/// Period of proactive sync-step-1 sends over the transport; `None`
	/// disables resync
	pub resync_interval: Option<Duration>,
	/// Upper bound of the reconnect backoff
	pub max_backoff_time: Duration,
	/// Fan out over the in-process broadcast bus
	pub enable_broadcast: bool,
	/// Extra query parameters appended to the endpoint URL
	pub params: Vec<(String, String)>,
	/// Transport implementation
	pub socket_factory: Arc<dyn SocketFactory>,
	/// Invoked when the relay denies access to the room
	pub on_permission_denied: Option<PermissionDeniedHandler>,
	/// Bus instance; defaults to the process-wide bus
	pub bus: BroadcastBus,
}

impl Default for ProviderOptions {
	fn default() -> Self {
		Self {
			connect_on_launch: true,
			resync_interval: None,
			max_backoff_time: Duration::from_millis(2500),
			enable_broadcast: true,
			params: Vec::new(),
			socket_factory: Arc::new(WsFactory),
			on_permission_denied: None,
			bus: BroadcastBus::global(),
		}
	}
}

struct ProviderInner {
	url: Box<str>,
	bc_channel: Box<str>,
	doc: Doc,
	awareness: Arc<Mutex<Awareness>>,
	/// Transaction origin marking updates this provider applied, so the
	/// document listener can skip the echo
	origin: Origin,
	bus_origin: BusOrigin,
	bus: BroadcastBus,
	factory: Arc<dyn SocketFactory>,
	resync_interval: Option<Duration>,
	max_backoff_time: Duration,
	enable_broadcast: bool,
	on_permission_denied: Option<PermissionDeniedHandler>,

	status: Mutex<ConnectionStatus>,
	synced: AtomicBool,
	should_connect: AtomicBool,
	bc_connected: AtomicBool,
	destroyed: AtomicBool,
	unsuccessful_reconnects: AtomicU32,
	/// tokio clock, so the watchdog follows a paused test clock
	last_message_received: Mutex<tokio::time::Instant>,
	/// Write half of the active socket; `None` while disconnected
	socket_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
	events: broadcast::Sender<ProviderEvent>,
	connect_notify: Notify,
	session_close: Notify,
	cancel: CancellationToken,
	bus_cancel: Mutex<Option<CancellationToken>>,
	doc_subscription: Mutex<Option<Subscription>>,
}

/// Client-side sync provider bound to one document, one room and one
/// relay endpoint.
///
/// Must be created inside a tokio runtime; the provider spawns its
/// connection loop and fan-out pump as background tasks. Dropping the
/// provider destroys it.
pub struct Provider {
	inner: Arc<ProviderInner>,
}

impl Provider {
	/// Create a provider with default options and connect immediately.
	pub fn new(server_url: &str, room: &str, doc: Doc) -> WireResult<Self> {
		Self::with_options(server_url, room, doc, ProviderOptions::default())
	}

	pub fn with_options(
		server_url: &str,
		room: &str,
		doc: Doc,
		options: ProviderOptions,
	) -> WireResult<Self> {
		let (url, bc_channel) = endpoint_url(server_url, room, &options.params)?;
		let bus_origin = next_bus_origin();
		let origin = Origin::from(format!("ywire-{}", bus_origin).as_str());
		let awareness = Arc::new(Mutex::new(Awareness::new(doc.client_id())));
		let (events, _) = broadcast::channel(64);

		let inner = Arc::new(ProviderInner {
			url: url.into(),
			bc_channel: bc_channel.into(),
			doc: doc.clone(),
			awareness,
			origin,
			bus_origin,
			bus: options.bus,
			factory: options.socket_factory,
			resync_interval: options.resync_interval,
			max_backoff_time: options.max_backoff_time,
			enable_broadcast: options.enable_broadcast,
			on_permission_denied: options.on_permission_denied,
			status: Mutex::new(ConnectionStatus::Disconnected),
			synced: AtomicBool::new(false),
			should_connect: AtomicBool::new(false),
			bc_connected: AtomicBool::new(false),
			destroyed: AtomicBool::new(false),
			unsuccessful_reconnects: AtomicU32::new(0),
			last_message_received: Mutex::new(tokio::time::Instant::now()),
			socket_tx: Mutex::new(None),
			events,
			connect_notify: Notify::new(),
			session_close: Notify::new(),
			cancel: CancellationToken::new(),
			bus_cancel: Mutex::new(None),
			doc_subscription: Mutex::new(None),
		});

		// updates applied by this provider come back through the listener
		// with our origin and are skipped; everything else fans out
		let (doc_tx, doc_rx) = mpsc::unbounded_channel::<Vec<u8>>();
		let echo_origin = inner.origin.clone();
		let subscription = doc
			.observe_update_v1(move |txn, event| {
				if txn.origin() != Some(&echo_origin) {
					let _ = doc_tx.send(event.update.clone());
				}
			})
			.map_err(|err| Error::Internal(format!("document observer: {}", err)))?;
		*inner.doc_subscription.lock() = Some(subscription);

		let awareness_rx = inner.awareness.lock().subscribe_update();
		tokio::spawn(run_pump(inner.clone(), doc_rx, awareness_rx));
		tokio::spawn(run_connection_loop(inner.clone()));

		let provider = Self { inner };
		if options.connect_on_launch {
			provider.connect();
		}
		Ok(provider)
	}

	/// Express the intent to stay connected; opens the transport and joins
	/// the bus. Safe to call at any time.
	pub fn connect(&self) {
		if self.inner.destroyed.load(Ordering::SeqCst) {
			return;
		}
		self.inner.should_connect.store(true, Ordering::SeqCst);
		self.inner.connect_notify.notify_one();
		self.connect_broadcast();
	}

	/// Close the transport and leave the bus. No reconnects are scheduled
	/// until [`Provider::connect`] is called again.
	pub fn disconnect(&self) {
		self.inner.should_connect.store(false, Ordering::SeqCst);
		self.disconnect_broadcast();
		self.inner.session_close.notify_waiters();
	}

	/// Join the local broadcast channel and run the late-join dance: our
	/// state vector, our full state, an awareness query and our awareness
	/// entry, so a late peer converges within a single subscribe.
	pub fn connect_broadcast(&self) {
		let inner = &self.inner;
		if !inner.enable_broadcast
			|| inner.destroyed.load(Ordering::SeqCst)
			|| inner.bc_connected.swap(true, Ordering::SeqCst)
		{
			return;
		}
		let receiver = inner.bus.subscribe(&inner.bc_channel);
		let token = inner.cancel.child_token();
		*inner.bus_cancel.lock() = Some(token.clone());
		tokio::spawn(run_bus(inner.clone(), receiver, token));

		let mut enc = Encoder::new();
		enc.write_var_u64(codec::MESSAGE_SYNC);
		sync::write_sync_step1(&mut enc, &inner.doc);
		inner.publish_bus(enc.into_bytes());

		let mut enc = Encoder::new();
		enc.write_var_u64(codec::MESSAGE_SYNC);
		if sync::write_sync_step2(&mut enc, &inner.doc, None).is_ok() {
			inner.publish_bus(enc.into_bytes());
		}

		let mut enc = Encoder::new();
		enc.write_var_u64(codec::MESSAGE_QUERY_AWARENESS);
		inner.publish_bus(enc.into_bytes());

		let awareness = inner.awareness.lock();
		match awareness.encode_update(&[awareness.client_id()]) {
			Ok(update) => {
				drop(awareness);
				inner.publish_bus(awareness_frame(&update));
			}
			Err(err) => warn!("failed to encode local awareness entry: {}", err),
		}
	}

	/// Publish a tombstone for the local client on both channels, then
	/// leave the bus. The tombstone is sent even when the encode partially
	/// fails or the bus was never joined, and the unsubscribe is
	/// unconditional.
	pub fn disconnect_broadcast(&self) {
		let inner = &self.inner;
		match inner.awareness.lock().encode_tombstone() {
			Ok(update) => inner.broadcast_both(awareness_frame(&update)),
			Err(err) => warn!("failed to encode disconnect marker: {}", err),
		}
		if inner.bc_connected.swap(false, Ordering::SeqCst) {
			if let Some(token) = inner.bus_cancel.lock().take() {
				token.cancel();
			}
			inner.bus.cleanup();
		}
	}

	/// Tear the provider down: timers, socket, bus subscription and
	/// document listener. Idempotent; every later call is a no-op.
	pub fn destroy(&self) {
		if self.inner.destroyed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.disconnect();
		self.inner.cancel.cancel();
		*self.inner.doc_subscription.lock() = None;
	}

	/// `true` after the initial handshake with the relay completed.
	pub fn synced(&self) -> bool {
		self.inner.synced.load(Ordering::SeqCst)
	}

	pub fn status(&self) -> ConnectionStatus {
		*self.inner.status.lock()
	}

	pub fn should_connect(&self) -> bool {
		self.inner.should_connect.load(Ordering::SeqCst)
	}

	pub fn broadcast_connected(&self) -> bool {
		self.inner.bc_connected.load(Ordering::SeqCst)
	}

	/// Full endpoint URL including query parameters.
	pub fn url(&self) -> &str {
		&self.inner.url
	}

	pub fn doc(&self) -> Doc {
		self.inner.doc.clone()
	}

	pub fn awareness(&self) -> Arc<Mutex<Awareness>> {
		self.inner.awareness.clone()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
		self.inner.events.subscribe()
	}
}

impl Drop for Provider {
	fn drop(&mut self) {
		self.destroy();
	}
}

impl ProviderInner {
	fn emit(&self, event: ProviderEvent) {
		let _ = self.events.send(event);
	}

	fn set_status(&self, status: ConnectionStatus) {
		let mut current = self.status.lock();
		if *current != status {
			*current = status;
			self.emit(ProviderEvent::Status(status));
		}
	}

	fn set_synced(&self, synced: bool) {
		let prev = self.synced.swap(synced, Ordering::SeqCst);
		if prev != synced {
			self.emit(ProviderEvent::Sync(synced));
			if synced {
				self.emit(ProviderEvent::Synced(true));
			}
		}
	}

	fn publish_bus(&self, frame: Vec<u8>) {
		if self.bc_connected.load(Ordering::SeqCst) {
			self.bus.publish(&self.bc_channel, frame, self.bus_origin);
		}
	}

	/// Fan a frame out to the socket (if connected) and the bus (if
	/// subscribed).
	fn broadcast_both(&self, frame: Vec<u8>) {
		if let Some(tx) = self.socket_tx.lock().as_ref() {
			let _ = tx.send(frame.clone());
		}
		self.publish_bus(frame);
	}
}

/// Route one incoming frame. Returns the reply frame, if the handlers
/// produced one beyond the bare message tag. `flip_synced` is set for
/// transport frames only: a step-2 from the bus must not complete the
/// relay handshake.
fn handle_message(
	inner: &Arc<ProviderInner>,
	frame: &[u8],
	flip_synced: bool,
) -> WireResult<Option<Vec<u8>>> {
	let mut dec = Decoder::new(frame);
	let mut reply = Encoder::new();
	match dec.read_var_u64()? {
		codec::MESSAGE_SYNC => {
			reply.write_var_u64(codec::MESSAGE_SYNC);
			let message = sync::read_sync_message(&mut dec, &mut reply, &inner.doc, &inner.origin)?;
			if flip_synced && message == SyncMessage::SyncStep2 {
				inner.set_synced(true);
			}
		}
		codec::MESSAGE_AWARENESS => {
			let update = dec.read_var_buf()?;
			inner.awareness.lock().apply_update(update, UpdateOrigin::Remote)?;
		}
		codec::MESSAGE_AUTH => {
			auth::read_auth_message(&mut dec, |reason| match &inner.on_permission_denied {
				Some(handler) => handler(reason),
				None => warn!("permission denied to access {}: {}", inner.url, reason),
			})?;
		}
		codec::MESSAGE_QUERY_AWARENESS => {
			let awareness = inner.awareness.lock();
			let clients: Vec<ClientId> = awareness.states().keys().copied().collect();
			match awareness.encode_update(&clients) {
				Ok(update) => {
					reply.write_var_u64(codec::MESSAGE_AWARENESS);
					reply.write_var_buf(&update);
				}
				Err(err) => warn!("failed to answer awareness query: {}", err),
			}
		}
		tag => {
			warn!("unable to route message with tag {}", tag);
			return Ok(None);
		}
	}
	if reply.len() > 1 { Ok(Some(reply.into_bytes())) } else { Ok(None) }
}

/// Long-lived fan-out pump: wraps document updates and awareness events
/// into frames for both channels, and drives the awareness sweeper.
async fn run_pump(
	inner: Arc<ProviderInner>,
	mut doc_rx: mpsc::UnboundedReceiver<Vec<u8>>,
	mut awareness_rx: broadcast::Receiver<(AwarenessEvent, UpdateOrigin)>,
) {
	let mut sweep = interval(OUTDATED_TIMEOUT / 10);
	sweep.tick().await;
	loop {
		tokio::select! {
			() = inner.cancel.cancelled() => return,
			update = doc_rx.recv() => {
				let Some(update) = update else { return };
				let mut enc = Encoder::new();
				enc.write_var_u64(codec::MESSAGE_SYNC);
				sync::write_update(&mut enc, &update);
				inner.broadcast_both(enc.into_bytes());
			}
			event = awareness_rx.recv() => {
				match event {
					Ok((event, origin)) => {
						// frames we applied ourselves are not echoed back out
						if origin == UpdateOrigin::Remote {
							continue;
						}
						let update = {
							let awareness = inner.awareness.lock();
							awareness.encode_update(&event.all_clients())
						};
						match update {
							Ok(update) => inner.broadcast_both(awareness_frame(&update)),
							Err(err) => warn!("failed to encode awareness update: {}", err),
						}
					}
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!("awareness event stream lagged by {} events", skipped);
					}
					Err(broadcast::error::RecvError::Closed) => return,
				}
			}
			_ = sweep.tick() => {
				inner.awareness.lock().sweep(Instant::now());
			}
		}
	}
}

/// Bus subscriber: applies foreign frames and answers on the bus only.
async fn run_bus(
	inner: Arc<ProviderInner>,
	mut receiver: broadcast::Receiver<BusMessage>,
	cancel: CancellationToken,
) {
	loop {
		tokio::select! {
			() = cancel.cancelled() => return,
			message = receiver.recv() => {
				match message {
					Ok(message) => {
						if message.origin == inner.bus_origin {
							continue;
						}
						match handle_message(&inner, &message.data, false) {
							Ok(Some(reply)) => {
								inner.bus.publish(&inner.bc_channel, reply, inner.bus_origin);
							}
							Ok(None) => {}
							Err(err) => warn!("dropping malformed bus frame: {}", err),
						}
					}
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!("bus subscriber lagged by {} frames", skipped);
					}
					Err(broadcast::error::RecvError::Closed) => return,
				}
			}
		}
	}
}

/// Connection loop: one iteration per attempt, with exponential backoff
/// between unsuccessful ones. Parks while the user does not want to be
/// connected.
async fn run_connection_loop(inner: Arc<ProviderInner>) {
	loop {
		if inner.cancel.is_cancelled() {
			return;
		}
		if !inner.should_connect.load(Ordering::SeqCst) {
			tokio::select! {
				() = inner.cancel.cancelled() => return,
				() = inner.connect_notify.notified() => continue,
			}
		}

		inner.set_status(ConnectionStatus::Connecting);
		inner.set_synced(false);
		let socket = tokio::select! {
			() = inner.cancel.cancelled() => return,
			socket = inner.factory.connect(&inner.url) => socket,
		};
		match socket {
			Ok(socket) => run_session(&inner, socket).await,
			Err(err) => {
				debug!("connection to {} failed: {}", inner.url, err);
				inner.unsuccessful_reconnects.fetch_add(1, Ordering::SeqCst);
				inner.emit(ProviderEvent::ConnectionError(err.to_string()));
				inner.emit(ProviderEvent::ConnectionClose(Some(err.to_string())));
			}
		}

		if inner.cancel.is_cancelled() {
			return;
		}
		if !inner.should_connect.load(Ordering::SeqCst) {
			continue;
		}
		let delay = backoff_delay(
			inner.unsuccessful_reconnects.load(Ordering::SeqCst),
			inner.max_backoff_time,
		);
		tokio::select! {
			() = inner.cancel.cancelled() => return,
			() = inner.connect_notify.notified() => {}
			() = tokio::time::sleep(delay) => {}
		}
	}
}

/// One open connection: handshake, then the serve loop until the socket
/// dies, the watchdog fires, or the user disconnects.
async fn run_session(inner: &Arc<ProviderInner>, mut socket: Box<dyn Socket>) {
	let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Vec<u8>>();
	*inner.socket_tx.lock() = Some(queue_tx);
	inner.unsuccessful_reconnects.store(0, Ordering::SeqCst);
	*inner.last_message_received.lock() = tokio::time::Instant::now();
	inner.set_status(ConnectionStatus::Connected);

	let mut close_reason: Option<String> = None;
	let mut alive = true;

	// announce our document state, then our awareness entry
	let mut handshake = Vec::new();
	{
		let mut enc = Encoder::new();
		enc.write_var_u64(codec::MESSAGE_SYNC);
		sync::write_sync_step1(&mut enc, &inner.doc);
		handshake.push(enc.into_bytes());

		let awareness = inner.awareness.lock();
		if awareness.local_state().is_some() {
			match awareness.encode_update(&[awareness.client_id()]) {
				Ok(update) => handshake.push(awareness_frame(&update)),
				Err(err) => warn!("failed to encode local awareness state: {}", err),
			}
		}
	}
	for frame in handshake {
		if let Err(err) = socket.send(frame).await {
			warn!("handshake send failed: {}", err);
			close_reason = Some(err.to_string());
			alive = false;
			break;
		}
	}

	let mut watchdog = interval(MESSAGE_RECONNECT_TIMEOUT / 10);
	watchdog.tick().await;
	let resync_enabled = inner.resync_interval.is_some();
	let mut resync = interval(inner.resync_interval.unwrap_or(Duration::from_secs(86_400)));
	resync.tick().await;

	while alive {
		if inner.cancel.is_cancelled() || !inner.should_connect.load(Ordering::SeqCst) {
			break;
		}
		tokio::select! {
			// queued outbound frames drain before a close request is honored
			biased;
			frame = queue_rx.recv() => {
				let Some(frame) = frame else { break };
				if let Err(err) = socket.send(frame).await {
					close_reason = Some(err.to_string());
					break;
				}
			}
			() = inner.cancel.cancelled() => break,
			() = inner.session_close.notified() => break,
			incoming = socket.recv() => {
				match incoming {
					Some(Ok(frame)) => {
						*inner.last_message_received.lock() = tokio::time::Instant::now();
						match handle_message(inner, &frame, true) {
							Ok(Some(reply)) => {
								if let Err(err) = socket.send(reply).await {
									close_reason = Some(err.to_string());
									break;
								}
							}
							Ok(None) => {}
							Err(err) => {
								// the stream is desynchronized; force a clean reconnect
								warn!("protocol error on transport frame: {}", err);
								close_reason = Some(err.to_string());
								break;
							}
						}
					}
					Some(Err(err)) => {
						inner.emit(ProviderEvent::ConnectionError(err.to_string()));
						close_reason = Some(err.to_string());
						break;
					}
					None => break,
				}
			}
			_ = watchdog.tick() => {
				let last = *inner.last_message_received.lock();
				if last.elapsed() > MESSAGE_RECONNECT_TIMEOUT {
					debug!("connection silent for {:?}, closing", MESSAGE_RECONNECT_TIMEOUT);
					break;
				}
			}
			_ = resync.tick(), if resync_enabled => {
				let mut enc = Encoder::new();
				enc.write_var_u64(codec::MESSAGE_SYNC);
				sync::write_sync_step1(&mut enc, &inner.doc);
				if let Err(err) = socket.send(enc.into_bytes()).await {
					close_reason = Some(err.to_string());
					break;
				}
			}
		}
	}

	socket.close().await;
	*inner.socket_tx.lock() = None;
	inner.emit(ProviderEvent::ConnectionClose(close_reason));
	inner.set_synced(false);
	{
		// peers are no longer observable through this connection
		let mut awareness = inner.awareness.lock();
		let remote: Vec<ClientId> = awareness
			.states()
			.keys()
			.copied()
			.filter(|client_id| *client_id != awareness.client_id())
			.collect();
		awareness.remove_states(&remote, UpdateOrigin::Remote);
	}
	inner.set_status(ConnectionStatus::Disconnected);
}

fn awareness_frame(update: &[u8]) -> Vec<u8> {
	let mut enc = Encoder::new();
	enc.write_var_u64(codec::MESSAGE_AWARENESS);
	enc.write_var_buf(update);
	enc.into_bytes()
}

/// `<serverUrl>/<room>?<params>` with trailing slashes stripped from the
/// server URL; the second element is the bus channel name (no query).
fn endpoint_url(
	server_url: &str,
	room: &str,
	params: &[(String, String)],
) -> WireResult<(String, String)> {
	let server_url = server_url.trim_end_matches('/');
	let bc_channel = format!("{}/{}", server_url, room);
	let url = if params.is_empty() {
		bc_channel.clone()
	} else {
		let query = serde_urlencoded::to_string(params)
			.map_err(|err| Error::Internal(format!("query encoding: {}", err)))?;
		format!("{}?{}", bc_channel, query)
	};
	Ok((url, bc_channel))
}

fn next_bus_origin() -> BusOrigin {
	static NEXT: AtomicU64 = AtomicU64::new(1);
	NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use serde_json::json;
	use yrs::{GetString, Text, Transact};

	fn doc_with_text(text: &str) -> Doc {
		let doc = Doc::new();
		let shared = doc.get_or_insert_text("shared");
		let mut txn = doc.transact_mut();
		shared.insert(&mut txn, 0, text);
		drop(txn);
		doc
	}

	fn text_of(doc: &Doc) -> String {
		let shared = doc.get_or_insert_text("shared");
		let txn = doc.transact();
		shared.get_string(&txn)
	}

	async fn wait_for(mut cond: impl FnMut() -> bool) {
		for _ in 0..2000 {
			if cond() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		assert!(cond(), "condition not reached in time");
	}

	/// Server half of an in-memory socket pair.
	struct TestRemote {
		to_client: mpsc::UnboundedSender<WireResult<Vec<u8>>>,
		from_client: mpsc::UnboundedReceiver<Vec<u8>>,
	}

	struct TestSocket {
		rx: mpsc::UnboundedReceiver<WireResult<Vec<u8>>>,
		tx: mpsc::UnboundedSender<Vec<u8>>,
	}

	#[async_trait]
	impl Socket for TestSocket {
		async fn send(&mut self, data: Vec<u8>) -> WireResult<()> {
			self.tx.send(data).map_err(|_| Error::ConnectionClosed)
		}

		async fn recv(&mut self) -> Option<WireResult<Vec<u8>>> {
			self.rx.recv().await
		}

		async fn close(&mut self) {}
	}

	struct TestFactory {
		remotes: mpsc::UnboundedSender<TestRemote>,
		connects: Arc<AtomicU32>,
	}

	impl TestFactory {
		fn new() -> (Self, mpsc::UnboundedReceiver<TestRemote>, Arc<AtomicU32>) {
			let (tx, rx) = mpsc::unbounded_channel();
			let connects = Arc::new(AtomicU32::new(0));
			(Self { remotes: tx, connects: connects.clone() }, rx, connects)
		}
	}

	#[async_trait]
	impl SocketFactory for TestFactory {
		async fn connect(&self, _url: &str) -> WireResult<Box<dyn Socket>> {
			self.connects.fetch_add(1, Ordering::SeqCst);
			let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
			let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
			self.remotes
				.send(TestRemote { to_client: to_client_tx, from_client: from_client_rx })
				.map_err(|_| Error::Network("test listener gone".into()))?;
			Ok(Box::new(TestSocket { rx: to_client_rx, tx: from_client_tx }))
		}
	}

	/// A factory whose connection attempts always fail.
	struct FailFactory {
		connects: Arc<AtomicU32>,
	}

	#[async_trait]
	impl SocketFactory for FailFactory {
		async fn connect(&self, _url: &str) -> WireResult<Box<dyn Socket>> {
			self.connects.fetch_add(1, Ordering::SeqCst);
			Err(Error::Network("connection refused".into()))
		}
	}

	fn test_options(factory: Arc<dyn SocketFactory>) -> ProviderOptions {
		ProviderOptions {
			connect_on_launch: false,
			enable_broadcast: false,
			socket_factory: factory,
			..Default::default()
		}
	}

	fn sync_step2_frame(doc: &Doc) -> Vec<u8> {
		let mut enc = Encoder::new();
		enc.write_var_u64(codec::MESSAGE_SYNC);
		sync::write_sync_step2(&mut enc, doc, None).unwrap();
		enc.into_bytes()
	}

	#[test]
	fn test_endpoint_url_building() {
		let (url, channel) = endpoint_url("wss://relay.test/", "room", &[]).unwrap();
		assert_eq!(url, "wss://relay.test/room");
		assert_eq!(channel, "wss://relay.test/room");

		let params = vec![("token".to_string(), "se cret".to_string())];
		let (url, channel) = endpoint_url("wss://relay.test//", "room", &params).unwrap();
		assert_eq!(url, "wss://relay.test/room?token=se+cret");
		assert_eq!(channel, "wss://relay.test/room");
	}

	#[tokio::test]
	async fn test_handshake_flips_synced_once() {
		let (factory, mut remotes, _) = TestFactory::new();
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			Doc::new(),
			test_options(Arc::new(factory)),
		)
		.unwrap();
		let mut events = provider.subscribe();
		provider.connect();

		let mut remote = remotes.recv().await.unwrap();
		// the client opens with sync step 1
		let step1 = remote.from_client.recv().await.unwrap();
		assert_eq!(&step1[..2], &[0, 0]);
		// and advertises its awareness entry
		let advert = remote.from_client.recv().await.unwrap();
		assert_eq!(advert[0], 1);

		// server answers with its full state
		let server_doc = doc_with_text("hello");
		remote.to_client.send(Ok(sync_step2_frame(&server_doc))).unwrap();

		wait_for(|| provider.synced()).await;
		assert_eq!(text_of(&provider.doc()), "hello");

		let mut statuses = Vec::new();
		let mut synced_events = 0;
		let mut sync_events = 0;
		while let Ok(event) = events.try_recv() {
			match event {
				ProviderEvent::Status(status) => statuses.push(status),
				ProviderEvent::Synced(true) => synced_events += 1,
				ProviderEvent::Sync(true) => sync_events += 1,
				_ => {}
			}
		}
		assert_eq!(
			statuses,
			vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
		);
		assert_eq!(synced_events, 1);
		assert_eq!(sync_events, 1);

		// a second step 2 must not re-fire the handshake events
		remote.to_client.send(Ok(sync_step2_frame(&server_doc))).unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;
		while let Ok(event) = events.try_recv() {
			assert!(
				!matches!(event, ProviderEvent::Synced(_) | ProviderEvent::Sync(_)),
				"unexpected event: {:?}",
				event
			);
		}
	}

	#[tokio::test]
	async fn test_replies_to_server_step1() {
		let (factory, mut remotes, _) = TestFactory::new();
		let doc = doc_with_text("client text");
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			doc,
			test_options(Arc::new(factory)),
		)
		.unwrap();
		provider.connect();

		let mut remote = remotes.recv().await.unwrap();
		let _step1 = remote.from_client.recv().await.unwrap();
		let _advert = remote.from_client.recv().await.unwrap();

		// the server wants what it is missing
		let server_doc = Doc::new();
		let mut enc = Encoder::new();
		enc.write_var_u64(codec::MESSAGE_SYNC);
		sync::write_sync_step1(&mut enc, &server_doc);
		remote.to_client.send(Ok(enc.into_bytes())).unwrap();

		let reply = remote.from_client.recv().await.unwrap();
		assert_eq!(&reply[..2], &[0, 1]);
		let mut dec = Decoder::new(&reply);
		let mut unused = Encoder::new();
		sync::read_sync_message(&mut dec, &mut unused, &server_doc, &Origin::from("server"))
			.unwrap();
		assert_eq!(text_of(&server_doc), "client text");
	}

	#[tokio::test]
	async fn test_local_edits_fan_out_without_echo() {
		let (factory, mut remotes, _) = TestFactory::new();
		let doc = Doc::new();
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			doc.clone(),
			test_options(Arc::new(factory)),
		)
		.unwrap();
		provider.connect();

		let mut remote = remotes.recv().await.unwrap();
		let _step1 = remote.from_client.recv().await.unwrap();
		let _advert = remote.from_client.recv().await.unwrap();

		// a local edit becomes a sync/update frame
		{
			let shared = doc.get_or_insert_text("shared");
			let mut txn = doc.transact_mut();
			shared.insert(&mut txn, 0, "abc");
		}
		let update = remote.from_client.recv().await.unwrap();
		assert_eq!(&update[..2], &[0, 2]);

		// an update applied from the transport must not come back out
		let server_doc = doc_with_text("zzz");
		remote.to_client.send(Ok(sync_step2_frame(&server_doc))).unwrap();
		wait_for(|| text_of(&provider.doc()).contains("zzz")).await;
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(
			remote.from_client.try_recv().is_err(),
			"remote update was echoed back to the transport"
		);
	}

	#[tokio::test]
	async fn test_disconnect_stops_reconnecting() {
		let (factory, mut remotes, connects) = TestFactory::new();
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			Doc::new(),
			test_options(Arc::new(factory)),
		)
		.unwrap();
		provider.connect();

		let remote = remotes.recv().await.unwrap();
		wait_for(|| provider.status() == ConnectionStatus::Connected).await;

		provider.disconnect();
		wait_for(|| provider.status() == ConnectionStatus::Disconnected).await;
		assert!(!provider.should_connect());
		assert!(!provider.synced());

		drop(remote);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(connects.load(Ordering::SeqCst), 1, "reconnected after disconnect");
	}

	#[tokio::test]
	async fn test_close_drops_remote_awareness_entries() {
		let (factory, mut remotes, _) = TestFactory::new();
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			Doc::new(),
			test_options(Arc::new(factory)),
		)
		.unwrap();
		provider.connect();

		let remote = remotes.recv().await.unwrap();
		wait_for(|| provider.status() == ConnectionStatus::Connected).await;

		// a peer announces itself over the transport
		let mut enc = Encoder::new();
		enc.write_var_u64(99);
		enc.write_var_u64(1);
		enc.write_var_string(r#"{"name":"peer"}"#);
		remote.to_client.send(Ok(awareness_frame(&enc.into_bytes()))).unwrap();
		wait_for(|| provider.awareness().lock().states().contains_key(&99)).await;

		// the server drops the connection; the peer is gone, we are not
		drop(remote);
		wait_for(|| !provider.awareness().lock().states().contains_key(&99)).await;
		let awareness = provider.awareness();
		let awareness = awareness.lock();
		assert!(awareness.local_state().is_some());
	}

	#[tokio::test(start_paused = true)]
	async fn test_failed_attempts_count_and_back_off() {
		let connects = Arc::new(AtomicU32::new(0));
		let factory = FailFactory { connects: connects.clone() };
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			Doc::new(),
			test_options(Arc::new(factory)),
		)
		.unwrap();
		let mut events = provider.subscribe();
		provider.connect();

		wait_for(|| connects.load(Ordering::SeqCst) >= 4).await;
		assert!(provider.inner.unsuccessful_reconnects.load(Ordering::SeqCst) >= 4);
		assert_eq!(provider.status(), ConnectionStatus::Connecting);

		let mut saw_error = false;
		while let Ok(event) = events.try_recv() {
			if matches!(event, ProviderEvent::ConnectionError(_)) {
				saw_error = true;
			}
		}
		assert!(saw_error);
	}

	#[tokio::test(start_paused = true)]
	async fn test_successful_open_resets_backoff() {
		let (factory, mut remotes, _) = TestFactory::new();
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			Doc::new(),
			test_options(Arc::new(factory)),
		)
		.unwrap();
		provider.inner.unsuccessful_reconnects.store(7, Ordering::SeqCst);
		provider.connect();

		let _remote = remotes.recv().await.unwrap();
		wait_for(|| provider.status() == ConnectionStatus::Connected).await;
		assert_eq!(provider.inner.unsuccessful_reconnects.load(Ordering::SeqCst), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_watchdog_recycles_silent_connection() {
		let (factory, mut remotes, connects) = TestFactory::new();
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			Doc::new(),
			test_options(Arc::new(factory)),
		)
		.unwrap();
		provider.connect();

		let _first = remotes.recv().await.unwrap();
		wait_for(|| provider.status() == ConnectionStatus::Connected).await;

		// no traffic at all: the watchdog must force a reconnect
		let _second = remotes.recv().await.unwrap();
		assert!(connects.load(Ordering::SeqCst) >= 2);
	}

	#[tokio::test]
	async fn test_destroy_is_idempotent() {
		let (factory, mut remotes, _) = TestFactory::new();
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			Doc::new(),
			test_options(Arc::new(factory)),
		)
		.unwrap();
		provider.connect();
		let _remote = remotes.recv().await.unwrap();

		provider.destroy();
		provider.destroy();
		provider.connect();
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(!provider.should_connect());
	}

	// ---- bus fan-out ----

	fn bus_options(bus: &BroadcastBus) -> ProviderOptions {
		let (factory, _remotes, _) = TestFactory::new();
		ProviderOptions {
			connect_on_launch: false,
			enable_broadcast: true,
			bus: bus.clone(),
			socket_factory: Arc::new(factory),
			..Default::default()
		}
	}

	#[tokio::test]
	async fn test_bus_peers_converge_documents() {
		let bus = BroadcastBus::new();
		let provider1 = Provider::with_options(
			"wss://relay.test",
			"room",
			doc_with_text("hello"),
			bus_options(&bus),
		)
		.unwrap();
		provider1.connect_broadcast();

		let provider2 =
			Provider::with_options("wss://relay.test", "room", Doc::new(), bus_options(&bus))
				.unwrap();
		provider2.connect_broadcast();

		// the join dance alone must converge the late peer
		wait_for(|| text_of(&provider2.doc()) == "hello").await;
		// and the bus must never complete the relay handshake
		assert!(!provider1.synced());
		assert!(!provider2.synced());
	}

	#[tokio::test]
	async fn test_bus_peers_share_awareness() {
		let bus = BroadcastBus::new();
		let provider1 =
			Provider::with_options("wss://relay.test", "room", Doc::new(), bus_options(&bus))
				.unwrap();
		provider1.connect_broadcast();
		let provider2 =
			Provider::with_options("wss://relay.test", "room", Doc::new(), bus_options(&bus))
				.unwrap();
		provider2.connect_broadcast();

		let client1 = provider1.doc().client_id();
		provider1
			.awareness()
			.lock()
			.set_local_state(Some(json!({ "name": "a" })));

		wait_for(|| {
			provider2.awareness().lock().states().get(&client1) == Some(&json!({ "name": "a" }))
		})
		.await;

		// leaving publishes a tombstone the peer applies immediately
		provider1.disconnect_broadcast();
		wait_for(|| !provider2.awareness().lock().states().contains_key(&client1)).await;
	}

	#[tokio::test]
	async fn test_bus_ignores_own_frames() {
		let bus = BroadcastBus::new();
		let provider =
			Provider::with_options("wss://relay.test", "room", Doc::new(), bus_options(&bus))
				.unwrap();
		provider.connect_broadcast();
		let mut rx = bus.subscribe("wss://relay.test/room");

		let step1 = {
			let mut enc = Encoder::new();
			enc.write_var_u64(codec::MESSAGE_SYNC);
			sync::write_sync_step1(&mut enc, &Doc::new());
			enc.into_bytes()
		};

		// a frame carrying the provider's own origin draws no reply; the only
		// traffic the subscriber sees is the frame itself
		bus.publish("wss://relay.test/room", step1.clone(), provider.inner.bus_origin);
		tokio::time::sleep(Duration::from_millis(50)).await;
		let mut replies = 0;
		while let Ok(message) = rx.try_recv() {
			if &*message.data != step1.as_slice() {
				replies += 1;
			}
		}
		assert_eq!(replies, 0, "provider replied to its own frame");

		// the same frame from a foreign origin draws a step-2 reply
		bus.publish("wss://relay.test/room", step1, u64::MAX);
		let reply = loop {
			let message = rx.recv().await.unwrap();
			if message.origin == provider.inner.bus_origin {
				break message;
			}
		};
		assert_eq!(&reply.data[..2], &[0, 1]);
	}

	#[tokio::test]
	async fn test_bus_step2_does_not_flip_synced() {
		let bus = BroadcastBus::new();
		let provider =
			Provider::with_options("wss://relay.test", "room", Doc::new(), bus_options(&bus))
				.unwrap();
		provider.connect_broadcast();

		let other = doc_with_text("from the bus");
		bus.publish("wss://relay.test/room", sync_step2_frame(&other), u64::MAX);

		wait_for(|| text_of(&provider.doc()) == "from the bus").await;
		assert!(!provider.synced());
	}

	#[tokio::test]
	async fn test_query_awareness_is_answered_on_the_bus() {
		let bus = BroadcastBus::new();
		let provider =
			Provider::with_options("wss://relay.test", "room", Doc::new(), bus_options(&bus))
				.unwrap();
		provider
			.awareness()
			.lock()
			.set_local_state(Some(json!({ "name": "q" })));
		provider.connect_broadcast();
		let mut rx = bus.subscribe("wss://relay.test/room");

		let mut enc = Encoder::new();
		enc.write_var_u64(codec::MESSAGE_QUERY_AWARENESS);
		bus.publish("wss://relay.test/room", enc.into_bytes(), u64::MAX);

		let reply = loop {
			let message = rx.recv().await.unwrap();
			if message.origin == provider.inner.bus_origin {
				break message;
			}
		};
		assert_eq!(reply.data[0], 1);

		let mut peer = Awareness::new(12345);
		let mut dec = Decoder::new(&reply.data[1..]);
		let update = dec.read_var_buf().unwrap();
		peer.apply_update(update, UpdateOrigin::Remote).unwrap();
		assert_eq!(
			peer.states().get(&provider.doc().client_id()),
			Some(&json!({ "name": "q" }))
		);
	}

	#[tokio::test]
	async fn test_permission_denied_reaches_handler() {
		let (factory, mut remotes, _) = TestFactory::new();
		let denied: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
		let denied_clone = denied.clone();
		let options = ProviderOptions {
			on_permission_denied: Some(Arc::new(move |reason: &str| {
				*denied_clone.lock() = Some(reason.to_string());
			})),
			..test_options(Arc::new(factory))
		};
		let provider =
			Provider::with_options("wss://relay.test", "room", Doc::new(), options).unwrap();
		provider.connect();

		let remote = remotes.recv().await.unwrap();
		let mut enc = Encoder::new();
		enc.write_var_u64(codec::MESSAGE_AUTH);
		auth::write_permission_denied(&mut enc, "room is locked");
		remote.to_client.send(Ok(enc.into_bytes())).unwrap();

		wait_for(|| denied.lock().is_some()).await;
		assert_eq!(denied.lock().as_deref(), Some("room is locked"));
		// the socket stays up; permission handling is the caller's business
		assert_eq!(provider.status(), ConnectionStatus::Connected);
	}

	#[tokio::test]
	async fn test_unknown_tag_is_dropped_quietly() {
		let (factory, mut remotes, _) = TestFactory::new();
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			Doc::new(),
			test_options(Arc::new(factory)),
		)
		.unwrap();
		provider.connect();

		let remote = remotes.recv().await.unwrap();
		wait_for(|| provider.status() == ConnectionStatus::Connected).await;

		let mut enc = Encoder::new();
		enc.write_var_u64(42);
		remote.to_client.send(Ok(enc.into_bytes())).unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(provider.status(), ConnectionStatus::Connected);
	}

	#[tokio::test]
	async fn test_truncated_frame_recycles_the_socket() {
		let (factory, mut remotes, connects) = TestFactory::new();
		let provider = Provider::with_options(
			"wss://relay.test",
			"room",
			Doc::new(),
			test_options(Arc::new(factory)),
		)
		.unwrap();
		provider.connect();

		let remote = remotes.recv().await.unwrap();
		wait_for(|| provider.status() == ConnectionStatus::Connected).await;

		// an awareness frame whose payload is cut short
		remote.to_client.send(Ok(vec![1, 50, 0, 0])).unwrap();
		let _second = remotes.recv().await.unwrap();
		assert!(connects.load(Ordering::SeqCst) >= 2);
	}
}

// vim: ts=4
