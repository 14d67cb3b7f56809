//! Decode a stash directory back into its byte stream

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use xstash_chunks::{ChunkInput, Observe, Reassembler, TransformStack};
use xstash_core::{StashError, StashResult, MANIFEST_FILE};
use xstash_crypto::{ChunkEntry, KdfParams, KeyCache, Opener, StashManifest};

use crate::ProgressFn;

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Must match the iterations used at encode time
    pub kdf: KdfParams,
    /// Bytes requested from each chunk file per read
    pub read_buffer: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            read_buffer: 64 * 1024,
        }
    }
}

/// Plaintext stream of a stash. Each chunk is authenticated before any of
/// its bytes are returned.
pub struct StashReader {
    manifest: StashManifest,
    inner: Reassembler<ChunkEntry>,
}

impl StashReader {
    pub fn manifest(&self) -> &StashManifest {
        &self.manifest
    }

    pub fn chunks_done(&self) -> usize {
        self.inner.chunks_done()
    }
}

impl Read for StashReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl std::fmt::Debug for StashReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StashReader")
            .field("size", &self.manifest.size)
            .field("chunks", &self.manifest.chunks().len())
            .field("chunks_done", &self.inner.chunks_done())
            .finish()
    }
}

#[derive(Debug)]
pub struct DecodeReport {
    pub manifest: StashManifest,
    pub bytes: u64,
}

/// Read and validate `dir/.xmap`.
pub fn load_manifest(dir: &Path) -> StashResult<StashManifest> {
    let path = dir.join(MANIFEST_FILE);
    let manifest = StashManifest::parse_file(&path).map_err(|e| match e {
        StashError::Io(io) if io.kind() == io::ErrorKind::NotFound => {
            StashError::Manifest(format!("no manifest at {}", path.display()))
        }
        other => other,
    })?;
    manifest.validate()?;
    Ok(manifest)
}

/// Open the stash in `dir` for reading.
///
/// Only the manifest is read here. Chunk files are opened one at a time as
/// the returned reader reaches them, so a missing or tampered chunk surfaces
/// as a read error once the stream gets there.
pub fn open_stash(
    dir: &Path,
    passphrase: &SecretString,
    options: &DecodeOptions,
    progress: Option<&ProgressFn>,
) -> StashResult<StashReader> {
    let manifest = load_manifest(dir)?;

    let inputs: Vec<_> = manifest
        .chunks()
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let path = dir.join(&record.file);
            let declared = record.size;
            let entry = ChunkEntry {
                index,
                record: record.clone(),
            };
            ChunkInput::new(entry, move || {
                let file = File::open(&path).map_err(|e| {
                    io::Error::new(e.kind(), format!("opening chunk file {}: {e}", path.display()))
                })?;
                let actual = file.metadata()?.len();
                if actual != declared {
                    return Err(StashError::Manifest(format!(
                        "chunk {index} ({}) is {actual} bytes on disk but the manifest declares {declared}",
                        path.display()
                    ))
                    .into());
                }
                Ok(Box::new(BufReader::new(file)) as Box<dyn Read + Send>)
            })
        })
        .collect();

    let keys = KeyCache::new(
        SecretString::from(passphrase.expose_secret().to_owned()),
        options.kdf.clone(),
    );
    let mut stack = TransformStack::new();
    stack.push("cipher", Box::new(Opener::new(keys)));
    if let Some(progress) = progress {
        let progress = ProgressFn::clone(progress);
        let total = manifest.size;
        let mut done = 0u64;
        stack.push(
            "progress",
            Box::new(Observe::new(move |entry: &ChunkEntry, n| {
                done += n;
                progress(done, Some(total), &format!("chunk {}", entry.index + 1));
            })),
        );
    }
    debug!(
        dir = %dir.display(),
        chunks = inputs.len(),
        stages = ?stack.labels(),
        "opening stash"
    );

    Ok(StashReader {
        inner: Reassembler::with_read_size(inputs, stack, options.read_buffer),
        manifest,
    })
}

/// Decode the stash in `dir` into `out`.
pub fn decode_stash<W: Write>(
    dir: &Path,
    passphrase: &SecretString,
    out: &mut W,
    options: &DecodeOptions,
    progress: Option<&ProgressFn>,
) -> StashResult<DecodeReport> {
    let mut reader = open_stash(dir, passphrase, options, progress)?;
    let bytes = io::copy(&mut reader, out).map_err(StashError::from_io)?;
    out.flush()?;

    let manifest = reader.manifest;
    if bytes != manifest.size {
        return Err(StashError::Stream(format!(
            "decoded {bytes} bytes but the manifest declares {}",
            manifest.size
        )));
    }
    info!(dir = %dir.display(), bytes, chunks = manifest.chunks().len(), "stash decoded");
    Ok(DecodeReport { manifest, bytes })
}

/// Authenticate every chunk of the stash in `dir` without keeping the
/// plaintext.
pub fn verify_stash(
    dir: &Path,
    passphrase: &SecretString,
    options: &DecodeOptions,
    progress: Option<&ProgressFn>,
) -> StashResult<DecodeReport> {
    decode_stash(dir, passphrase, &mut io::sink(), options, progress)
}
