//! xstash-engine: stash directories on disk
//!
//! A stash is a directory holding one ciphertext file per chunk plus the
//! `.xmap` manifest:
//!
//! ```text
//!   encode_stash:  Read ─▶ Segmenter ─▶ [progress, cipher] ─▶ <dir>/<chunk files>
//!                                                        └─▶ <dir>/.xmap (written last)
//!   open_stash:    <dir>/.xmap ─▶ Reassembler([cipher, progress]) ─▶ Read
//!   clean_stash:   delete files in <dir> the manifest does not reference
//! ```

pub mod clean;
pub mod decode;
pub mod encode;
pub mod naming;

use std::sync::Arc;

pub use clean::{clean_stash, CleanReport};
pub use decode::{decode_stash, load_manifest, open_stash, verify_stash, DecodeOptions, DecodeReport, StashReader};
pub use encode::{encode_stash, EncodeOptions, EncodeReport};
pub use naming::ChunkNaming;

/// Progress callback (bytes_done, bytes_total if known, message)
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>, &str) + Send + Sync>;
