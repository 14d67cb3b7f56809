//! xstash-crypto: per-chunk encryption and the stash manifest
//!
//! Key scheme:
//! ```text
//! passphrase ──PBKDF2-HMAC-SHA256(salt, 10 000 rounds)──▶ group key (256-bit)
//!   one fresh 32-byte salt per group of `group_by` consecutive chunks
//!   └── chunk AEAD: AES-256-GCM (key=group key, iv=random 128-bit, no AAD)
//!       ciphertext is written as-is; iv, tag and salt go to the manifest
//! ```
//!
//! `binding` plugs the cipher into the chunk transform stacks of
//! `xstash-chunks`; `manifest` is the `.xmap` document format.

pub mod binding;
pub mod cipher;
pub mod kdf;
pub mod manifest;

pub use binding::{ChunkEntry, KeyCache, KeyRotation, Opener, SealTicket, Sealer};
pub use cipher::{decrypt_chunk, encrypt_chunk, generate_iv};
pub use kdf::{derive_group_key, GroupKey, KdfParams};
pub use manifest::{BinaryEncoding, ChunkRecord, CompressInfo, EncodedManifest, StashManifest};

/// Size of a group key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a per-chunk AES-GCM IV (128-bit)
pub const IV_SIZE: usize = 16;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a group salt
pub const SALT_SIZE: usize = 32;

/// PBKDF2 rounds used when deriving group keys
pub const PBKDF2_ITERATIONS: u32 = 10_000;
