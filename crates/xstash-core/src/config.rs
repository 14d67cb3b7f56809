use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{StashError, StashResult};
use crate::types::CompressionMethod;

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XstashConfig {
    pub stash: StashConfig,
    pub pack: PackConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StashConfig {
    /// Number of chunks to split a sized stream into (default: 50)
    pub chunks: u64,
    /// Fixed chunk size in bytes; takes precedence over `chunks`
    pub chunk_size: Option<u64>,
    /// Chunks sharing one derived key (default: 5)
    pub group_by: usize,
    /// Fold the size remainder into the last chunk instead of a short extra chunk
    pub append_overflow: bool,
    /// Bytes requested from the producer per read (default: 64 KiB)
    pub read_buffer: usize,
    /// Chunk file name template, e.g. "part-{padded_number}.xpart" (default: random hex)
    pub chunk_name_template: Option<String>,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            chunks: 50,
            chunk_size: None,
            group_by: 5,
            append_overflow: true,
            read_buffer: 64 * 1024,
            chunk_name_template: None,
        }
    }
}

impl StashConfig {
    /// Reject values that can never produce a valid encode.
    pub fn validate(&self) -> StashResult<()> {
        if self.group_by == 0 {
            return Err(StashError::Config("stash.group_by must be at least 1".into()));
        }
        if self.chunk_size == Some(0) {
            return Err(StashError::Config("stash.chunk_size must be at least 1".into()));
        }
        if self.chunk_size.is_none() && self.chunks == 0 {
            return Err(StashError::Config("stash.chunks must be at least 1".into()));
        }
        if self.read_buffer == 0 {
            return Err(StashError::Config("stash.read_buffer must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Compression applied before chunking: "none", "gzip" or "lz4"
    pub compression: String,
    /// Directory for the temporary spool used to size packed input
    pub spool_dir: Option<PathBuf>,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            compression: "gzip".into(),
            spool_dir: None,
        }
    }
}

impl PackConfig {
    pub fn compression_method(&self) -> StashResult<CompressionMethod> {
        self.compression.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
