pub use crate::error::{Error, WireResult};

pub use tracing::{debug, error, info, warn};

// vim: ts=4
