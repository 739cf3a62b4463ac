//! Auth frames. The client never issues credentials, it only learns that
//! the relay denied access to a room.

use crate::codec::{Decoder, Encoder};
use crate::prelude::*;

pub const PERMISSION_DENIED: u64 = 0;

pub fn write_permission_denied(enc: &mut Encoder, reason: &str) {
	enc.write_var_u64(PERMISSION_DENIED);
	enc.write_var_string(reason);
}

/// Read one auth message; permission-denied invokes the handler with the
/// relay's reason. Unknown auth sub-tags are logged and skipped.
pub fn read_auth_message<F>(dec: &mut Decoder, mut on_permission_denied: F) -> WireResult<()>
where
	F: FnMut(&str),
{
	match dec.read_var_u64()? {
		PERMISSION_DENIED => {
			let reason = dec.read_var_string()?;
			on_permission_denied(&reason);
		}
		other => warn!("unknown auth message type: {}", other),
	}
	Ok(())
}


// vim: ts=4
