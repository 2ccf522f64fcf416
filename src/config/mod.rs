//! Configuration module
//!
//! A `Settings` value is a per-tree snapshot: every `Tree` owns its own
//! copy and never consults process-wide state after construction. The
//! environment loader exists only as a convenience for building the
//! initial snapshot.

mod io;
mod settings;

pub use io::load_from_env;
pub use settings::{Settings, DEFAULT_CLIENT_TIMEOUT, DEFAULT_TREE_TIMEOUT};
