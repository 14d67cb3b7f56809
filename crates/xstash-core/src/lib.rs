pub mod config;
pub mod error;
pub mod types;

pub use error::{StashError, StashResult};
pub use types::{CompressionMethod, StashKind};

/// File name of the manifest inside a stash directory
pub const MANIFEST_FILE: &str = ".xmap";

/// Extension given to randomly named chunk files
pub const CHUNK_EXTENSION: &str = "xpart";
