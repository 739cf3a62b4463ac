//! y-sync protocol messages.
//!
//! Three sub-messages inside a `sync` frame drive document convergence:
//! step 1 carries a state vector, step 2 carries the update computed
//! against it, and `update` carries incremental changes. The client sends
//! step 1 on connect; receiving step 2 completes the handshake.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use crate::codec::{Decoder, Encoder};
use crate::prelude::*;

pub const SYNC_STEP_1: u64 = 0;
pub const SYNC_STEP_2: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

/// Which sub-message a `sync` frame carried. The provider flips its
/// `synced` flag only on [`SyncMessage::SyncStep2`] read from the
/// transport, never on [`SyncMessage::Update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMessage {
	SyncStep1,
	SyncStep2,
	Update,
}

/// Append a step-1 message advertising the document's state vector.
pub fn write_sync_step1(enc: &mut Encoder, doc: &Doc) {
	enc.write_var_u64(SYNC_STEP_1);
	enc.write_var_buf(&doc.transact().state_vector().encode_v1());
}

/// Append a step-2 message with the update a peer at `remote_sv` is
/// missing. `None` stands for the empty state vector, i.e. the full state.
pub fn write_sync_step2(enc: &mut Encoder, doc: &Doc, remote_sv: Option<&[u8]>) -> WireResult<()> {
	let sv = match remote_sv {
		Some(bytes) => {
			StateVector::decode_v1(bytes).map_err(|err| Error::Decode(err.to_string()))?
		}
		None => StateVector::default(),
	};
	enc.write_var_u64(SYNC_STEP_2);
	enc.write_var_buf(&doc.transact().encode_state_as_update_v1(&sv));
	Ok(())
}

/// Append an incremental update message.
pub fn write_update(enc: &mut Encoder, update: &[u8]) {
	enc.write_var_u64(SYNC_UPDATE);
	enc.write_var_buf(update);
}

/// Read a step-1 message and append the matching step-2 reply.
pub fn read_sync_step1(dec: &mut Decoder, reply: &mut Encoder, doc: &Doc) -> WireResult<()> {
	let remote_sv = dec.read_var_buf()?;
	write_sync_step2(reply, doc, Some(remote_sv))
}

/// Read a step-2 or update message and apply it to the document with the
/// given transaction origin. A blob the engine rejects is logged and
/// swallowed: one malformed update must not take down the session.
pub fn read_sync_step2(dec: &mut Decoder, doc: &Doc, origin: &Origin) -> WireResult<()> {
	let blob = dec.read_var_buf()?;
	match Update::decode_v1(blob) {
		Ok(update) => {
			let mut txn = doc.transact_mut_with(origin.clone());
			if let Err(err) = txn.apply_update(update) {
				warn!("error while applying document update: {}", err);
			}
		}
		Err(err) => warn!("error while decoding document update: {}", err),
	}
	Ok(())
}

/// Dispatch one `sync` frame body. Any reply is appended to `reply`, which
/// the caller has already tagged as a `sync` frame.
pub fn read_sync_message(
	dec: &mut Decoder,
	reply: &mut Encoder,
	doc: &Doc,
	origin: &Origin,
) -> WireResult<SyncMessage> {
	match dec.read_var_u64()? {
		SYNC_STEP_1 => {
			read_sync_step1(dec, reply, doc)?;
			Ok(SyncMessage::SyncStep1)
		}
		SYNC_STEP_2 => {
			read_sync_step2(dec, doc, origin)?;
			Ok(SyncMessage::SyncStep2)
		}
		SYNC_UPDATE => {
			read_sync_step2(dec, doc, origin)?;
			Ok(SyncMessage::Update)
		}
		other => Err(Error::Decode(format!("unknown sync message type: {}", other))),
	}
}


// vim: ts=4
