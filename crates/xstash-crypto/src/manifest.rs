//! The `.xmap` stash manifest
//!
//! One JSON document per stash. Binary fields are text-encoded (hex by
//! default):
//! ```text
//! {
//!   "key":  "<64 hex>",   vestigial, random, never used for decryption
//!   "tag":  "<32 hex>",   vestigial, random, never used for decryption
//!   "size": 1048576,      stream bytes == sum of chunk sizes
//!   "type": "object",     or "folder" (stream is a tar archive)
//!   "compress": { "id": 1, "size": 1048576 },
//!   "chunks": [ { "iv": "<32 hex>", "tag": "<32 hex>", "salt": "<64 hex>",
//!                 "file": "<name>", "size": 262144 }, ... ]
//! }
//! ```
//! Chunk order is stream order. Records are only ever appended.

use std::fs;
use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use xstash_core::{CompressionMethod, StashError, StashKind, StashResult, MANIFEST_FILE};

use crate::{IV_SIZE, KEY_SIZE, SALT_SIZE, TAG_SIZE};

/// Text encoding used for binary manifest fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BinaryEncoding {
    #[default]
    Hex,
    Base64,
}

impl BinaryEncoding {
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            BinaryEncoding::Hex => hex::encode(bytes),
            BinaryEncoding::Base64 => {
                use base64::engine::general_purpose::STANDARD;
                use base64::Engine;
                STANDARD.encode(bytes)
            }
        }
    }

    pub fn decode(self, text: &str) -> StashResult<Vec<u8>> {
        match self {
            BinaryEncoding::Hex => {
                hex::decode(text).map_err(|e| StashError::Manifest(format!("hex decode: {e}")))
            }
            BinaryEncoding::Base64 => {
                use base64::engine::general_purpose::STANDARD;
                use base64::Engine;
                STANDARD
                    .decode(text)
                    .map_err(|e| StashError::Manifest(format!("base64 decode: {e}")))
            }
        }
    }

    fn decode_fixed<const N: usize>(self, field: &str, text: &str) -> StashResult<[u8; N]> {
        let bytes = self.decode(text)?;
        bytes.as_slice().try_into().map_err(|_| {
            StashError::Manifest(format!(
                "{field}: expected {N} bytes, found {}",
                bytes.len()
            ))
        })
    }
}

impl std::str::FromStr for BinaryEncoding {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hex" => Ok(BinaryEncoding::Hex),
            "base64" => Ok(BinaryEncoding::Base64),
            other => Err(StashError::Config(format!(
                "unknown encoding: {other} (expected hex or base64)"
            ))),
        }
    }
}

/// Cryptographic record of one chunk file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub iv: [u8; IV_SIZE],
    pub tag: [u8; TAG_SIZE],
    /// Salt of the key group this chunk belongs to
    pub salt: [u8; SALT_SIZE],
    /// Chunk file name, relative to the stash directory
    pub file: String,
    /// Plaintext (== ciphertext) length
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressInfo {
    pub method: CompressionMethod,
    /// Length of the compressed stream that was chunked
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashManifest {
    /// Vestigial random field kept for format compatibility
    pub key: [u8; KEY_SIZE],
    /// Vestigial random field kept for format compatibility
    pub tag: [u8; TAG_SIZE],
    pub size: u64,
    pub kind: StashKind,
    pub compress: CompressInfo,
    chunks: Vec<ChunkRecord>,
}

/// Serialized shape of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedManifest {
    pub key: String,
    pub tag: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: StashKind,
    pub compress: EncodedCompress,
    pub chunks: Vec<EncodedChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedCompress {
    pub id: CompressionMethod,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedChunk {
    pub iv: String,
    pub tag: String,
    pub salt: String,
    pub file: String,
    pub size: u64,
}

impl StashManifest {
    /// Start an empty manifest with fresh random `key`/`tag` fields.
    pub fn new(kind: StashKind, compression: CompressionMethod) -> Self {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; KEY_SIZE];
        let mut tag = [0u8; TAG_SIZE];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut tag);
        Self {
            key,
            tag,
            size: 0,
            kind,
            compress: CompressInfo {
                method: compression,
                size: 0,
            },
            chunks: Vec::new(),
        }
    }

    /// Append a chunk record; insertion order is stream order.
    pub fn stash_chunk(&mut self, record: ChunkRecord) {
        self.chunks.push(record);
    }

    pub fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    /// Sum of recorded chunk sizes; fails when it does not fit in a `u64`.
    pub fn chunk_bytes(&self) -> StashResult<u64> {
        self.chunks
            .iter()
            .try_fold(0u64, |sum, c| sum.checked_add(c.size))
            .ok_or_else(|| StashError::Manifest("chunk sizes overflow".into()))
    }

    /// Number of distinct key groups.
    pub fn group_count(&self) -> usize {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(i, c)| *i == 0 || self.chunks[i - 1].salt != c.salt)
            .count()
    }

    /// Check structural invariants: sizes add up and chunk names are plain
    /// file names inside the stash directory.
    pub fn validate(&self) -> StashResult<()> {
        let chunk_bytes = self.chunk_bytes()?;
        if chunk_bytes != self.size {
            return Err(StashError::Manifest(format!(
                "chunk sizes add up to {chunk_bytes} bytes but the manifest declares {}",
                self.size
            )));
        }
        for (index, chunk) in self.chunks.iter().enumerate() {
            if !is_plain_file_name(&chunk.file) {
                return Err(StashError::Manifest(format!(
                    "chunk {index} has an invalid file name: {:?}",
                    chunk.file
                )));
            }
        }
        Ok(())
    }

    pub fn encode(&self, encoding: BinaryEncoding) -> EncodedManifest {
        EncodedManifest {
            key: encoding.encode(&self.key),
            tag: encoding.encode(&self.tag),
            size: self.size,
            kind: self.kind,
            compress: EncodedCompress {
                id: self.compress.method,
                size: self.compress.size,
            },
            chunks: self
                .chunks
                .iter()
                .map(|c| EncodedChunk {
                    iv: encoding.encode(&c.iv),
                    tag: encoding.encode(&c.tag),
                    salt: encoding.encode(&c.salt),
                    file: c.file.clone(),
                    size: c.size,
                })
                .collect(),
        }
    }

    /// Serialize to JSON; `pretty` indents with two spaces.
    pub fn stringify(&self, encoding: BinaryEncoding, pretty: bool) -> StashResult<String> {
        let doc = self.encode(encoding);
        let text = if pretty {
            serde_json::to_string_pretty(&doc)
        } else {
            serde_json::to_string(&doc)
        };
        text.map_err(|e| StashError::Manifest(format!("manifest serialization: {e}")))
    }

    pub fn decode(doc: &EncodedManifest, encoding: BinaryEncoding) -> StashResult<Self> {
        let chunks = doc
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Ok(ChunkRecord {
                    iv: encoding.decode_fixed(&format!("chunks[{i}].iv"), &c.iv)?,
                    tag: encoding.decode_fixed(&format!("chunks[{i}].tag"), &c.tag)?,
                    salt: encoding.decode_fixed(&format!("chunks[{i}].salt"), &c.salt)?,
                    file: c.file.clone(),
                    size: c.size,
                })
            })
            .collect::<StashResult<Vec<_>>>()?;

        Ok(Self {
            key: encoding.decode_fixed("key", &doc.key)?,
            tag: encoding.decode_fixed("tag", &doc.tag)?,
            size: doc.size,
            kind: doc.kind,
            compress: CompressInfo {
                method: doc.compress.id,
                size: doc.compress.size,
            },
            chunks,
        })
    }

    /// Parse a hex-encoded manifest.
    pub fn parse(text: &str) -> StashResult<Self> {
        Self::parse_with(text, BinaryEncoding::Hex)
    }

    pub fn parse_with(text: &str, encoding: BinaryEncoding) -> StashResult<Self> {
        let doc: EncodedManifest = serde_json::from_str(text)
            .map_err(|e| StashError::Manifest(format!("manifest parse: {e}")))?;
        Self::decode(&doc, encoding)
    }

    pub fn parse_file(path: &Path) -> StashResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Write `.xmap` (pretty, hex) into `dir`.
    pub fn write_to_dir(&self, dir: &Path) -> StashResult<()> {
        let text = self.stringify(BinaryEncoding::Hex, true)?;
        fs::write(dir.join(MANIFEST_FILE), text)?;
        Ok(())
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name != MANIFEST_FILE
        && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seed: u8, size: u64) -> ChunkRecord {
        ChunkRecord {
            iv: [seed; IV_SIZE],
            tag: [seed.wrapping_add(1); TAG_SIZE],
            salt: [seed / 2; SALT_SIZE],
            file: format!("{seed:02x}.xpart"),
            size,
        }
    }

    fn sample() -> StashManifest {
        let mut manifest = StashManifest::new(StashKind::Folder, CompressionMethod::Lz4);
        manifest.stash_chunk(record(0, 5));
        manifest.stash_chunk(record(1, 5));
        manifest.stash_chunk(record(2, 7));
        manifest.size = 17;
        manifest.compress.size = 17;
        manifest
    }

    #[test]
    fn test_stash_chunk_preserves_order() {
        let manifest = sample();
        let files: Vec<_> = manifest.chunks().iter().map(|c| c.file.as_str()).collect();
        assert_eq!(files, vec!["00.xpart", "01.xpart", "02.xpart"]);
        assert_eq!(manifest.chunk_bytes().unwrap(), 17);
        assert_eq!(manifest.group_count(), 2);
    }

    #[test]
    fn test_wire_shape() {
        let manifest = sample();
        let value: serde_json::Value =
            serde_json::from_str(&manifest.stringify(BinaryEncoding::Hex, false).unwrap()).unwrap();

        assert_eq!(value["type"], "folder");
        assert_eq!(value["size"], 17);
        assert_eq!(value["compress"]["id"], 2);
        assert_eq!(value["key"].as_str().unwrap().len(), 64);
        assert_eq!(value["tag"].as_str().unwrap().len(), 32);
        let chunk = &value["chunks"][1];
        assert_eq!(chunk["iv"], "01".repeat(16));
        assert_eq!(chunk["tag"].as_str().unwrap().len(), 32);
        assert_eq!(chunk["salt"].as_str().unwrap().len(), 64);
        assert_eq!(chunk["file"], "01.xpart");
        assert_eq!(chunk["size"], 5);
    }

    #[test]
    fn test_parse_stringify_roundtrip() {
        let manifest = sample();
        let text = manifest.stringify(BinaryEncoding::Hex, true).unwrap();
        let parsed = StashManifest::parse(&text).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.stringify(BinaryEncoding::Hex, true).unwrap(), text);
    }

    #[test]
    fn test_pretty_uses_two_spaces() {
        let text = sample().stringify(BinaryEncoding::Hex, true).unwrap();
        assert!(text.starts_with("{\n  \"key\""));
    }

    #[test]
    fn test_base64_reencoding() {
        let manifest = sample();
        let text = manifest.stringify(BinaryEncoding::Base64, false).unwrap();
        let parsed = StashManifest::parse_with(&text, BinaryEncoding::Base64).unwrap();
        assert_eq!(parsed, manifest);
        // base64 text is not valid hex
        assert!(StashManifest::parse(&text).is_err());
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let manifest = sample();
        let mut value: serde_json::Value =
            serde_json::from_str(&manifest.stringify(BinaryEncoding::Hex, false).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("size");
        let err = StashManifest::parse(&value.to_string()).unwrap_err();
        assert!(matches!(err, StashError::Manifest(_)));

        let mut value: serde_json::Value =
            serde_json::from_str(&manifest.stringify(BinaryEncoding::Hex, false).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("chunks");
        assert!(StashManifest::parse(&value.to_string()).is_err());

        let mut value: serde_json::Value =
            serde_json::from_str(&manifest.stringify(BinaryEncoding::Hex, false).unwrap()).unwrap();
        value["chunks"][0].as_object_mut().unwrap().remove("salt");
        assert!(StashManifest::parse(&value.to_string()).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_lengths_and_ids() {
        let manifest = sample();
        let mut value: serde_json::Value =
            serde_json::from_str(&manifest.stringify(BinaryEncoding::Hex, false).unwrap()).unwrap();
        value["chunks"][0]["iv"] = "abcd".into();
        let err = StashManifest::parse(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("chunks[0].iv"));

        let mut value: serde_json::Value =
            serde_json::from_str(&manifest.stringify(BinaryEncoding::Hex, false).unwrap()).unwrap();
        value["compress"]["id"] = 9.into();
        assert!(StashManifest::parse(&value.to_string()).is_err());

        assert!(StashManifest::parse("not json").is_err());
    }

    #[test]
    fn test_validate() {
        let mut manifest = sample();
        assert!(manifest.validate().is_ok());

        manifest.size = 18;
        assert!(matches!(manifest.validate(), Err(StashError::Manifest(_))));

        let mut traversal = sample();
        traversal.stash_chunk(ChunkRecord {
            file: "../escape".into(),
            size: 0,
            ..record(3, 0)
        });
        assert!(traversal.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overflowing_sizes() {
        let mut manifest = StashManifest::new(StashKind::Object, CompressionMethod::None);
        manifest.stash_chunk(record(0, 1 << 63));
        manifest.stash_chunk(record(1, 1 << 63));
        manifest.size = 0;
        assert!(matches!(manifest.chunk_bytes(), Err(StashError::Manifest(_))));
        match manifest.validate() {
            Err(StashError::Manifest(msg)) => assert!(msg.contains("overflow")),
            other => panic!("expected manifest error, got {other:?}"),
        }
    }

    #[test]
    fn test_new_manifests_get_distinct_vestigial_fields() {
        let a = StashManifest::new(StashKind::Object, CompressionMethod::None);
        let b = StashManifest::new(StashKind::Object, CompressionMethod::None);
        assert_ne!(a.key, b.key);
        assert!(a.chunks().is_empty());
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest = sample();
        manifest.write_to_dir(dir.path()).unwrap();
        let parsed = StashManifest::parse_file(&dir.path().join(MANIFEST_FILE)).unwrap();
        assert_eq!(parsed, manifest);

        let missing = StashManifest::parse_file(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(missing, StashError::Io(_)));
    }
}
