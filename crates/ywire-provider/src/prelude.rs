pub use ywire_protocol::error::{Error, WireResult};

pub use tracing::{debug, error, info, warn};

// vim: ts=4
