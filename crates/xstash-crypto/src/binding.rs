//! Cipher stages for the chunk transform stacks
//!
//! - [`Sealer`] (encode): rotates group keys every `group_by` chunks, picks a
//!   fresh IV per chunk, encrypts, and leaves the resulting record on the
//!   chunk's [`SealTicket`].
//! - [`Opener`] (decode): derives the key for each record's salt (re-deriving
//!   only when the salt changes), verifies the tag and releases plaintext.
//!
//! GCM authenticates a whole chunk at once, so both stages hold one chunk in
//! memory and emit it from `finish`. An `Opener` never releases a byte of a
//! chunk whose tag failed.

use std::collections::HashSet;

use secrecy::SecretString;
use tracing::{debug, trace};
use xstash_chunks::{hand_over, ChunkMeta, ChunkTransform};
use xstash_core::{StashError, StashResult};
use zeroize::Zeroize;

use crate::cipher::{decrypt_chunk, encrypt_chunk, generate_iv};
use crate::kdf::{derive_group_key, GroupKey, KdfParams};
use crate::manifest::ChunkRecord;
use crate::{IV_SIZE, SALT_SIZE, TAG_SIZE};

/// Upper bound on the chunk buffer reserved up front; larger chunks grow as
/// their bytes arrive.
const RESERVE_LIMIT: u64 = 4 * 1024 * 1024;

// ── Encode side ───────────────────────────────────────────────────────────────

/// Owns group-key rotation state while encoding.
pub struct KeyRotation {
    passphrase: SecretString,
    params: KdfParams,
    group_by: usize,
    used_in_group: usize,
    groups: usize,
    current: Option<GroupKey>,
}

impl KeyRotation {
    pub fn new(passphrase: SecretString, group_by: usize, params: KdfParams) -> StashResult<Self> {
        if group_by == 0 {
            return Err(StashError::Config("group_by must be at least 1".into()));
        }
        Ok(Self {
            passphrase,
            params,
            group_by,
            used_in_group: 0,
            groups: 0,
            current: None,
        })
    }

    /// Key for the next chunk; a new salt and key every `group_by` chunks.
    pub fn next_key(&mut self) -> StashResult<&GroupKey> {
        if self.current.is_none() || self.used_in_group == self.group_by {
            self.current = Some(GroupKey::generate(&self.passphrase, &self.params)?);
            self.used_in_group = 0;
            self.groups += 1;
            debug!(group = self.groups - 1, "derived group key");
        }
        self.used_in_group += 1;
        self.current()
    }

    pub fn current(&self) -> StashResult<&GroupKey> {
        self.current
            .as_ref()
            .ok_or_else(|| StashError::Crypto("no group key has been derived yet".into()))
    }

    /// Groups started so far.
    pub fn groups(&self) -> usize {
        self.groups
    }
}

#[derive(Debug, Clone, Copy)]
struct Seal {
    iv: [u8; IV_SIZE],
    tag: [u8; TAG_SIZE],
    salt: [u8; SALT_SIZE],
    size: u64,
}

/// Per-chunk context on the encode side: where the chunk goes, and once
/// sealed, its cryptographic record.
#[derive(Debug, Clone)]
pub struct SealTicket {
    pub chunk: ChunkMeta,
    pub file: String,
    seal: Option<Seal>,
}

impl SealTicket {
    pub fn new(chunk: ChunkMeta, file: impl Into<String>) -> Self {
        Self {
            chunk,
            file: file.into(),
            seal: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.seal.is_some()
    }

    /// The manifest record for this chunk. Fails if no cipher stage sealed it.
    pub fn into_record(self) -> StashResult<ChunkRecord> {
        let seal = self.seal.ok_or_else(|| {
            StashError::Crypto(format!("chunk {} was never sealed", self.chunk.index))
        })?;
        Ok(ChunkRecord {
            iv: seal.iv,
            tag: seal.tag,
            salt: seal.salt,
            file: self.file,
            size: seal.size,
        })
    }
}

/// Encrypting stage.
pub struct Sealer {
    keys: KeyRotation,
    iv: [u8; IV_SIZE],
    used_ivs: HashSet<[u8; IV_SIZE]>,
    buf: Vec<u8>,
}

impl Sealer {
    pub fn new(keys: KeyRotation) -> Self {
        Self {
            keys,
            iv: [0u8; IV_SIZE],
            used_ivs: HashSet::new(),
            buf: Vec::new(),
        }
    }

    pub fn groups(&self) -> usize {
        self.keys.groups()
    }
}

impl ChunkTransform<SealTicket> for Sealer {
    fn begin(&mut self, ticket: &mut SealTicket) -> StashResult<()> {
        self.keys.next_key()?;
        let mut iv = generate_iv();
        while !self.used_ivs.insert(iv) {
            iv = generate_iv();
        }
        self.iv = iv;
        self.buf.clear();
        self.buf.reserve(ticket.chunk.target_size.min(RESERVE_LIMIT) as usize);
        Ok(())
    }

    fn update(&mut self, _ticket: &mut SealTicket, input: &[u8], _out: &mut Vec<u8>) -> StashResult<()> {
        self.buf.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, ticket: &mut SealTicket, out: &mut Vec<u8>) -> StashResult<()> {
        let key = self.keys.current()?;
        let tag = encrypt_chunk(key, &self.iv, &mut self.buf)?;
        ticket.seal = Some(Seal {
            iv: self.iv,
            tag,
            salt: *key.salt(),
            size: self.buf.len() as u64,
        });
        trace!(chunk = ticket.chunk.index, bytes = self.buf.len(), "chunk sealed");
        hand_over(&mut self.buf, out);
        Ok(())
    }
}

// ── Decode side ───────────────────────────────────────────────────────────────

/// Per-chunk context on the decode side.
#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub index: usize,
    pub record: ChunkRecord,
}

/// Remembers the key of the most recent salt.
pub struct KeyCache {
    passphrase: SecretString,
    params: KdfParams,
    current: Option<GroupKey>,
    derivations: usize,
}

impl KeyCache {
    pub fn new(passphrase: SecretString, params: KdfParams) -> Self {
        Self {
            passphrase,
            params,
            current: None,
            derivations: 0,
        }
    }

    pub fn key_for(&mut self, salt: &[u8; SALT_SIZE]) -> StashResult<&GroupKey> {
        let stale = self.current.as_ref().map_or(true, |key| key.salt() != salt);
        if stale {
            self.current = Some(derive_group_key(&self.passphrase, salt, &self.params)?);
            self.derivations += 1;
        }
        self.current
            .as_ref()
            .ok_or_else(|| StashError::Crypto("key cache is empty".into()))
    }

    /// Number of PBKDF2 runs so far.
    pub fn derivations(&self) -> usize {
        self.derivations
    }
}

/// Decrypting stage.
pub struct Opener {
    keys: KeyCache,
    buf: Vec<u8>,
}

impl Opener {
    pub fn new(keys: KeyCache) -> Self {
        Self {
            keys,
            buf: Vec::new(),
        }
    }
}

impl ChunkTransform<ChunkEntry> for Opener {
    fn begin(&mut self, entry: &mut ChunkEntry) -> StashResult<()> {
        self.buf.clear();
        self.buf.reserve(entry.record.size.min(RESERVE_LIMIT) as usize);
        Ok(())
    }

    fn update(&mut self, _entry: &mut ChunkEntry, input: &[u8], _out: &mut Vec<u8>) -> StashResult<()> {
        self.buf.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, entry: &mut ChunkEntry, out: &mut Vec<u8>) -> StashResult<()> {
        let record = &entry.record;
        let key = self.keys.key_for(&record.salt)?;
        if decrypt_chunk(key, &record.iv, &record.tag, &mut self.buf).is_err() {
            self.buf.zeroize();
            return Err(StashError::Authentication {
                index: entry.index,
                file: record.file.clone(),
            });
        }
        trace!(chunk = entry.index, bytes = self.buf.len(), "chunk authenticated");
        hand_over(&mut self.buf, out);
        Ok(())
    }
}
