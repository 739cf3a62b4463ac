//! Awareness engine: ephemeral per-client presence state.
//!
//! Each client owns one JSON value (cursor, name, status, ...) guarded by a
//! monotonic clock. Updates are last-writer-wins on the clock; a `null`
//! state is a tombstone. Entries of silent peers are evicted after
//! [`OUTDATED_TIMEOUT`], while the local entry is kept alive by periodic
//! re-assertion. The wire format is bit-exact with the Yjs awareness
//! protocol.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::codec::{Decoder, Encoder};
use crate::prelude::*;

/// Client identifier handed out by the document engine.
pub type ClientId = u64;

/// How long a remote client may stay silent before its state is dropped.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer for the `change`/`update` event channels.
const EVENT_BUFFER: usize = 64;

/// Book-keeping for every client ever observed. An entry can outlive its
/// state (tombstone after a remote null).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaClientState {
	pub clock: u32,
	pub last_updated: Instant,
}

/// Where an awareness mutation came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOrigin {
	/// The local client assigned its own state
	Local,
	/// The liveness sweeper evicted a silent peer
	Timeout,
	/// A frame received from the transport or the local bus
	Remote,
	/// Application-defined origin
	Custom(Box<str>),
}

/// Clients touched by one awareness mutation. For `change` events `updated`
/// only lists clients whose state deeply changed; for `update` events it
/// lists every client that was re-asserted, changed or not.
#[derive(Debug, Clone, Default)]
pub struct AwarenessEvent {
	pub added: Vec<ClientId>,
	pub updated: Vec<ClientId>,
	pub removed: Vec<ClientId>,
}

impl AwarenessEvent {
	fn is_empty(&self) -> bool {
		self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
	}

	/// Every client touched, for wire re-broadcast.
	pub fn all_clients(&self) -> Vec<ClientId> {
		let mut clients =
			Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
		clients.extend_from_slice(&self.added);
		clients.extend_from_slice(&self.updated);
		clients.extend_from_slice(&self.removed);
		clients
	}
}

pub struct Awareness {
	client_id: ClientId,
	states: HashMap<ClientId, Value>,
	meta: HashMap<ClientId, MetaClientState>,
	change_tx: broadcast::Sender<(AwarenessEvent, UpdateOrigin)>,
	update_tx: broadcast::Sender<(AwarenessEvent, UpdateOrigin)>,
}

impl Awareness {
	/// Create an engine for the given client. The local state starts as an
	/// empty object, which is a valid, broadcastable state.
	pub fn new(client_id: ClientId) -> Self {
		let (change_tx, _) = broadcast::channel(EVENT_BUFFER);
		let (update_tx, _) = broadcast::channel(EVENT_BUFFER);
		let mut awareness = Self {
			client_id,
			states: HashMap::new(),
			meta: HashMap::new(),
			change_tx,
			update_tx,
		};
		awareness.set_local_state(Some(Value::Object(serde_json::Map::new())));
		awareness
	}

	pub fn client_id(&self) -> ClientId {
		self.client_id
	}

	pub fn states(&self) -> &HashMap<ClientId, Value> {
		&self.states
	}

	pub fn meta(&self) -> &HashMap<ClientId, MetaClientState> {
		&self.meta
	}

	pub fn local_state(&self) -> Option<&Value> {
		self.states.get(&self.client_id)
	}

	/// `change` fires when the set of states materially changed: a client
	/// appeared, disappeared, or its state is deeply unequal to before.
	pub fn subscribe_change(&self) -> broadcast::Receiver<(AwarenessEvent, UpdateOrigin)> {
		self.change_tx.subscribe()
	}

	/// `update` also fires for same-value re-assertions, which peers need
	/// to observe as keep-alives.
	pub fn subscribe_update(&self) -> broadcast::Receiver<(AwarenessEvent, UpdateOrigin)> {
		self.update_tx.subscribe()
	}

	/// Assign the local state. `None` removes it. Every call advances the
	/// local clock by exactly one.
	pub fn set_local_state(&mut self, state: Option<Value>) {
		let client_id = self.client_id;
		let clock = self.meta.get(&client_id).map_or(0, |meta| meta.clock.wrapping_add(1));
		let prev = match &state {
			None => self.states.remove(&client_id),
			Some(state) => self.states.insert(client_id, state.clone()),
		};
		self.meta.insert(client_id, MetaClientState { clock, last_updated: Instant::now() });

		let mut added = Vec::new();
		let mut updated = Vec::new();
		let mut filtered_updated = Vec::new();
		let mut removed = Vec::new();
		match (&prev, &state) {
			(_, None) => removed.push(client_id),
			(None, Some(_)) => added.push(client_id),
			(Some(prev), Some(state)) => {
				updated.push(client_id);
				if prev != state {
					filtered_updated.push(client_id);
				}
			}
		}
		self.emit(
			AwarenessEvent { added: added.clone(), updated: filtered_updated, removed: removed.clone() },
			AwarenessEvent { added, updated, removed },
			UpdateOrigin::Local,
		);
	}

	/// Merge one field into the local state object. A missing or non-object
	/// local state is treated as empty; a removed local state is left alone.
	pub fn set_local_state_field(&mut self, field: &str, value: Value) {
		let Some(state) = self.local_state() else { return };
		let mut map = match state {
			Value::Object(map) => map.clone(),
			_ => serde_json::Map::new(),
		};
		map.insert(field.to_string(), value);
		self.set_local_state(Some(Value::Object(map)));
	}

	/// Apply a received update blob.
	///
	/// A record is accepted when its clock is newer than the known one, or
	/// equal while tombstoning a still-present entry. A remote attempt to
	/// null the local client is overruled by bumping the clock instead.
	pub fn apply_update(&mut self, blob: &[u8], origin: UpdateOrigin) -> WireResult<()> {
		let now = Instant::now();
		let mut dec = Decoder::new(blob);
		let mut added = Vec::new();
		let mut updated = Vec::new();
		let mut filtered_updated = Vec::new();
		let mut removed = Vec::new();

		let len = dec.read_var_u64()?;
		for _ in 0..len {
			let client_id = dec.read_var_u64()?;
			let mut clock =
				u32::try_from(dec.read_var_u64()?).map_err(|_| Error::VarIntOverflow)?;
			let state: Value = serde_json::from_str(&dec.read_var_string()?)?;
			let is_null = state.is_null();

			let client_meta = self.meta.get(&client_id).copied();
			let prev = self.states.get(&client_id).cloned();
			let known_clock = client_meta.map_or(0, |meta| meta.clock);
			let accept = known_clock < clock
				|| (known_clock == clock && is_null && self.states.contains_key(&client_id));
			if !accept {
				continue;
			}

			if is_null {
				if client_id == self.client_id && self.local_state().is_some() {
					// a remote peer tried to remove us; keep the state and
					// outrank the tombstone
					clock = clock.wrapping_add(1);
				} else {
					self.states.remove(&client_id);
				}
			} else {
				self.states.insert(client_id, state.clone());
			}
			self.meta.insert(client_id, MetaClientState { clock, last_updated: now });

			if client_meta.is_none() && !is_null {
				added.push(client_id);
			} else if client_meta.is_some() && is_null {
				removed.push(client_id);
			} else if !is_null {
				if prev.as_ref() != Some(&state) {
					filtered_updated.push(client_id);
				}
				updated.push(client_id);
			}
		}

		self.emit(
			AwarenessEvent { added: added.clone(), updated: filtered_updated, removed: removed.clone() },
			AwarenessEvent { added, updated, removed },
			origin,
		);
		Ok(())
	}

	/// Drop the states of the given clients. Removing the local client also
	/// bumps its clock so the removal outranks earlier assertions.
	pub fn remove_states(&mut self, clients: &[ClientId], origin: UpdateOrigin) {
		let now = Instant::now();
		let mut removed = Vec::new();
		for &client_id in clients {
			if self.states.remove(&client_id).is_none() {
				continue;
			}
			if client_id == self.client_id {
				if let Some(meta) = self.meta.get(&client_id).copied() {
					self.meta.insert(
						client_id,
						MetaClientState { clock: meta.clock.wrapping_add(1), last_updated: now },
					);
				}
			}
			removed.push(client_id);
		}
		if !removed.is_empty() {
			self.emit(
				AwarenessEvent { removed: removed.clone(), ..Default::default() },
				AwarenessEvent { removed, ..Default::default() },
				origin,
			);
		}
	}

	/// Encode the current entries of the given clients.
	pub fn encode_update(&self, clients: &[ClientId]) -> WireResult<Vec<u8>> {
		self.encode_update_with_states(clients, &self.states)
	}

	/// Encode against an override states map; clients absent from the map
	/// encode as `null`. A client with no known clock aborts the encode.
	pub fn encode_update_with_states(
		&self,
		clients: &[ClientId],
		states: &HashMap<ClientId, Value>,
	) -> WireResult<Vec<u8>> {
		let mut enc = Encoder::new();
		enc.write_var_u64(clients.len() as u64);
		for &client_id in clients {
			let clock =
				self.meta.get(&client_id).ok_or(Error::UnknownClient(client_id))?.clock;
			let state = states.get(&client_id).unwrap_or(&Value::Null);
			enc.write_var_u64(client_id);
			enc.write_var_u64(u64::from(clock));
			enc.write_var_string(&serde_json::to_string(state)?);
		}
		Ok(enc.into_bytes())
	}

	/// Bump the local clock and encode a tombstone for the local client,
	/// keeping the state itself for a later rejoin. Used by the provider's
	/// leave dance so the marker outranks every earlier assertion.
	pub fn encode_tombstone(&mut self) -> WireResult<Vec<u8>> {
		let meta = self
			.meta
			.get_mut(&self.client_id)
			.ok_or(Error::UnknownClient(self.client_id))?;
		meta.clock = meta.clock.wrapping_add(1);
		meta.last_updated = Instant::now();
		self.encode_update_with_states(&[self.client_id], &HashMap::new())
	}

	/// One liveness pass, driven externally every `OUTDATED_TIMEOUT / 10`:
	/// re-assert the local state once half the timeout has passed, evict
	/// remote entries older than the full timeout.
	pub fn sweep(&mut self, now: Instant) {
		let local = self.client_id;
		let renew = self.states.contains_key(&local)
			&& self.meta.get(&local).is_some_and(|meta| {
				now.saturating_duration_since(meta.last_updated) >= OUTDATED_TIMEOUT / 2
			});
		if renew {
			if let Some(state) = self.states.get(&local).cloned() {
				self.set_local_state(Some(state));
			}
		}

		let stale: Vec<ClientId> = self
			.meta
			.iter()
			.filter(|(client_id, meta)| {
				**client_id != local
					&& now.saturating_duration_since(meta.last_updated) >= OUTDATED_TIMEOUT
					&& self.states.contains_key(*client_id)
			})
			.map(|(client_id, _)| *client_id)
			.collect();
		if !stale.is_empty() {
			self.remove_states(&stale, UpdateOrigin::Timeout);
		}
	}

	fn emit(&self, change: AwarenessEvent, update: AwarenessEvent, origin: UpdateOrigin) {
		if !change.is_empty() {
			let _ = self.change_tx.send((change, origin.clone()));
		}
		if !update.is_empty() {
			let _ = self.update_tx.send((update, origin));
		}
	}
}

impl std::fmt::Debug for Awareness {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Awareness")
			.field("client_id", &self.client_id)
			.field("states", &self.states)
			.field("meta", &self.meta)
			.finish_non_exhaustive()
	}
}

/// Rewrite the states inside an update blob, leaving client ids and clocks
/// untouched. Relays use this to patch identity fields in transit.
pub fn modify_update<F>(blob: &[u8], mut modify: F) -> WireResult<Vec<u8>>
where
	F: FnMut(Value) -> Value,
{
	let mut dec = Decoder::new(blob);
	let mut enc = Encoder::new();
	let len = dec.read_var_u64()?;
	enc.write_var_u64(len);
	for _ in 0..len {
		let client_id = dec.read_var_u64()?;
		let clock = dec.read_var_u64()?;
		let state: Value = serde_json::from_str(&dec.read_var_string()?)?;
		enc.write_var_u64(client_id);
		enc.write_var_u64(clock);
		enc.write_var_string(&serde_json::to_string(&modify(state))?);
	}
	Ok(enc.into_bytes())
}


// vim: ts=4
