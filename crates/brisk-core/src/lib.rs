//! Core shared types for Brisk.
//!
//! This crate is intentionally small: it only holds the leaf types that every other Brisk crate
//! needs to agree on.

mod file_type;
mod path;
mod time;

pub use file_type::FileType;
pub use path::{file_name_of, normalize_rel_path, relative_path_string};
pub use time::{now_millis, system_time_to_nanos};

/// Version of the running Brisk build, recorded in persisted cache entries.
pub const BRISK_VERSION: &str = env!("CARGO_PKG_VERSION");
