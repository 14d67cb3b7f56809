//! Encode a byte stream into a stash directory

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use xstash_chunks::{ChunkMeta, Observe, Part, SegmentSpec, Segmenter, TransformStack};
use xstash_core::config::StashConfig;
use xstash_core::{CompressionMethod, StashError, StashKind, StashResult, MANIFEST_FILE};
use xstash_crypto::{KdfParams, KeyRotation, SealTicket, Sealer, StashManifest};

use crate::naming::ChunkNaming;
use crate::ProgressFn;

#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// Explicit chunk size; when unset the stream is cut into `chunk_count` chunks
    pub chunk_size: Option<u64>,
    pub chunk_count: u64,
    pub append_overflow: bool,
    /// Chunks per key group
    pub group_by: usize,
    /// Bytes requested from the input per read
    pub read_buffer: usize,
    pub naming: ChunkNaming,
    /// Recorded in the manifest for the unpacking side
    pub kind: StashKind,
    /// Recorded in the manifest for the unpacking side
    pub compression: CompressionMethod,
    pub kdf: KdfParams,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        let config = StashConfig::default();
        Self {
            chunk_size: config.chunk_size,
            chunk_count: config.chunks,
            append_overflow: config.append_overflow,
            group_by: config.group_by,
            read_buffer: config.read_buffer,
            naming: ChunkNaming::Random,
            kind: StashKind::Object,
            compression: CompressionMethod::None,
            kdf: KdfParams::default(),
        }
    }
}

impl EncodeOptions {
    pub fn from_config(config: &StashConfig) -> StashResult<Self> {
        config.validate()?;
        Ok(Self {
            chunk_size: config.chunk_size,
            chunk_count: config.chunks,
            append_overflow: config.append_overflow,
            group_by: config.group_by,
            read_buffer: config.read_buffer,
            naming: ChunkNaming::from_config(config.chunk_name_template.as_deref())?,
            kind: StashKind::Object,
            compression: CompressionMethod::None,
            kdf: KdfParams::default(),
        })
    }

    pub fn segment_spec(&self, total: Option<u64>) -> SegmentSpec {
        match self.chunk_size {
            Some(size) => SegmentSpec::by_size(size, total).with_append_overflow(self.append_overflow),
            None => SegmentSpec {
                chunk_size: None,
                chunk_count: Some(self.chunk_count),
                total_size: total,
                append_overflow: true,
            },
        }
    }
}

/// Result of encoding a stash
#[derive(Debug)]
pub struct EncodeReport {
    pub dir: PathBuf,
    pub manifest: StashManifest,
    pub chunks: usize,
    pub groups: usize,
    pub bytes: u64,
}

struct OpenChunk {
    ticket: SealTicket,
    path: PathBuf,
    file: BufWriter<File>,
}

/// Writes sealed chunk files and collects their records.
struct ChunkWriter<'a> {
    dir: &'a Path,
    naming: &'a ChunkNaming,
    open: Option<OpenChunk>,
    out: Vec<u8>,
    manifest: StashManifest,
}

impl ChunkWriter<'_> {
    fn write_part(&mut self, part: Part, stack: &mut TransformStack<SealTicket>) -> StashResult<()> {
        let same_chunk = self
            .open
            .as_ref()
            .is_some_and(|open| open.ticket.chunk.index == part.chunk.index);
        if !same_chunk {
            if let Some(open) = &self.open {
                return Err(StashError::Stream(format!(
                    "chunk {} ended before its final part",
                    open.ticket.chunk.index
                )));
            }
            self.start(&part.chunk, stack)?;
        }

        let Some(open) = self.open.as_mut() else {
            return Err(StashError::Stream("no chunk file is open".into()));
        };
        self.out.clear();
        stack.update(&mut open.ticket, &part.data, &mut self.out)?;
        open.file.write_all(&self.out)?;

        if part.part.is_final_part {
            self.out.clear();
            stack.finish(&mut open.ticket, &mut self.out)?;
            open.file.write_all(&self.out)?;
            self.close()?;
        }
        Ok(())
    }

    fn start(&mut self, chunk: &ChunkMeta, stack: &mut TransformStack<SealTicket>) -> StashResult<()> {
        let name = self.naming.name(chunk)?;
        let path = self.dir.join(&name);
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| io::Error::new(e.kind(), format!("creating chunk file {}: {e}", path.display())))?;

        let mut ticket = SealTicket::new(chunk.clone(), name);
        stack.begin(&mut ticket)?;
        self.open = Some(OpenChunk {
            ticket,
            path,
            file: BufWriter::new(file),
        });
        Ok(())
    }

    /// Flush the chunk file to disk, then record it.
    fn close(&mut self) -> StashResult<()> {
        let Some(OpenChunk { ticket, path, file }) = self.open.take() else {
            return Ok(());
        };
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let record = ticket.into_record()?;
        debug!(
            chunk = self.manifest.chunks().len(),
            file = %path.display(),
            bytes = record.size,
            "chunk written"
        );
        self.manifest.stash_chunk(record);
        Ok(())
    }
}

/// Encode `input` into chunk files under `dir` and write `dir/.xmap`.
///
/// `total` is the exact stream length, or `None` for an unknown length
/// (which requires an explicit chunk size). Chunk files already written are
/// left in place if encoding fails part-way; see [`crate::clean_stash`].
pub fn encode_stash<R: Read>(
    mut input: R,
    total: Option<u64>,
    dir: &Path,
    passphrase: &SecretString,
    options: &EncodeOptions,
    progress: Option<&ProgressFn>,
) -> StashResult<EncodeReport> {
    if options.read_buffer == 0 {
        return Err(StashError::Config("read buffer must be at least 1 byte".into()));
    }
    let mut segmenter = Segmenter::new(&options.segment_spec(total))?;
    let keys = KeyRotation::new(
        SecretString::from(passphrase.expose_secret().to_owned()),
        options.group_by,
        options.kdf.clone(),
    )?;

    if dir.join(MANIFEST_FILE).exists() {
        return Err(StashError::Config(format!(
            "{} already holds a stash",
            dir.display()
        )));
    }
    fs::create_dir_all(dir)?;

    let mut stack = TransformStack::new();
    if let Some(progress) = progress {
        let progress = ProgressFn::clone(progress);
        let mut done = 0u64;
        stack.push(
            "progress",
            Box::new(Observe::new(move |ticket: &SealTicket, n| {
                done += n;
                progress(done, total, &format!("chunk {}", ticket.chunk.number));
            })),
        );
    }
    stack.push("cipher", Box::new(Sealer::new(keys)));
    debug!(stages = ?stack.labels(), plan = ?segmenter.plan(), "encoding");

    let mut writer = ChunkWriter {
        dir,
        naming: &options.naming,
        open: None,
        out: Vec::new(),
        manifest: StashManifest::new(options.kind, options.compression),
    };

    loop {
        let mut buf = BytesMut::zeroed(options.read_buffer);
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StashError::from_io(e)),
        };
        buf.truncate(n);
        for part in segmenter.feed(buf.freeze())? {
            writer.write_part(part, &mut stack)?;
        }
    }
    for part in segmenter.finish()? {
        writer.write_part(part, &mut stack)?;
    }
    if let Some(open) = &writer.open {
        return Err(StashError::Stream(format!(
            "stream ended inside chunk {}",
            open.ticket.chunk.index
        )));
    }

    let mut manifest = writer.manifest;
    manifest.size = segmenter.bytes_read();
    manifest.compress.size = manifest.size;
    manifest.validate()?;
    manifest.write_to_dir(dir)?;

    let groups = manifest.group_count();
    let chunks = manifest.chunks().len();
    info!(
        dir = %dir.display(),
        chunks,
        groups,
        bytes = manifest.size,
        "stash encoded"
    );

    Ok(EncodeReport {
        dir: dir.to_path_buf(),
        bytes: manifest.size,
        chunks,
        groups,
        manifest,
    })
}
