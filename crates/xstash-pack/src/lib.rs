//! xstash-pack: turn a path into the byte stream that gets chunked, and back
//!
//! ```text
//!   pack:    dir ──tar──┐
//!            file ──────┴──▶ [gzip | lz4 | none] ──▶ (reader, total | unknown)
//!   unpack:  reader ──▶ [gunzip | lz4 | none] ──▶ untar into dir | write file
//! ```
//!
//! A sized pack spools the stream to an anonymous temp file to learn its
//! length; a streaming pack runs the packer on a worker thread behind a
//! bounded pipe and reports an unknown total.

pub mod pipe;

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use tracing::{debug, info};
use xstash_core::{CompressionMethod, StashKind};

use crate::pipe::pipe;

/// Frames of this size travel through the streaming pipe.
const PIPE_FRAME_SIZE: usize = 64 * 1024;

/// Frames buffered between the packer thread and the reader.
const PIPE_DEPTH: usize = 8;

#[derive(Debug, Clone, Default)]
pub enum PackMode {
    /// Spool to a temp file (in `spool_dir`, or the system temp dir) so the
    /// total size is known up front
    Sized { spool_dir: Option<PathBuf> },
    /// Stream through a pipe; the total is unknown
    #[default]
    Streaming,
}

/// A packed stream ready for segmentation.
pub struct Packed {
    pub reader: Box<dyn Read + Send>,
    /// Stream length, `None` when streaming
    pub total: Option<u64>,
    pub kind: StashKind,
    pub compression: CompressionMethod,
}

impl std::fmt::Debug for Packed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packed")
            .field("total", &self.total)
            .field("kind", &self.kind)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

/// Result of unpacking a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unpacked {
    /// Regular files written
    pub files: u64,
    /// Bytes of file content written
    pub bytes: u64,
}

pub fn kind_of(path: &Path) -> Result<StashKind> {
    let meta = fs::metadata(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(if meta.is_dir() {
        StashKind::Folder
    } else {
        StashKind::Object
    })
}

/// Pack `input` (a file or a directory) into a stream.
pub fn pack(input: &Path, compression: CompressionMethod, mode: &PackMode) -> Result<Packed> {
    let kind = kind_of(input)?;
    debug!(input = %input.display(), %kind, %compression, "packing");

    match mode {
        PackMode::Sized { .. } if kind == StashKind::Object && compression == CompressionMethod::None => {
            let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
            let total = file.metadata()?.len();
            Ok(Packed {
                reader: Box::new(BufReader::new(file)),
                total: Some(total),
                kind,
                compression,
            })
        }
        PackMode::Sized { spool_dir } => {
            let spool = match spool_dir {
                Some(dir) => tempfile::tempfile_in(dir)
                    .with_context(|| format!("creating spool file in {}", dir.display()))?,
                None => tempfile::tempfile().context("creating spool file")?,
            };
            let mut spool = write_stream(input, kind, compression, BufWriter::new(spool))?
                .into_inner()
                .map_err(|e| e.into_error())
                .context("flushing spool file")?;
            let total = spool.stream_position()?;
            spool.seek(SeekFrom::Start(0))?;
            info!(input = %input.display(), bytes = total, %compression, "packed into spool");
            Ok(Packed {
                reader: Box::new(BufReader::new(spool)),
                total: Some(total),
                kind,
                compression,
            })
        }
        PackMode::Streaming => {
            let (writer, reader) = pipe(PIPE_DEPTH, PIPE_FRAME_SIZE);
            let errors = writer.error_handle();
            let source = input.to_path_buf();
            thread::Builder::new()
                .name("xstash-pack".into())
                .spawn(move || {
                    let outcome = write_stream(&source, kind, compression, writer)
                        .and_then(|writer| writer.finish().context("closing pack stream"));
                    if let Err(e) = outcome {
                        errors.fail(io::Error::new(io::ErrorKind::Other, format!("{e:#}")));
                    }
                })
                .context("spawning packer thread")?;
            Ok(Packed {
                reader: Box::new(reader),
                total: None,
                kind,
                compression,
            })
        }
    }
}

/// Write the packed (and compressed) form of `input` into `sink`.
fn write_stream<W: Write>(
    input: &Path,
    kind: StashKind,
    compression: CompressionMethod,
    sink: W,
) -> Result<W> {
    match compression {
        CompressionMethod::None => write_payload(input, kind, sink),
        CompressionMethod::Gzip => {
            let encoder = write_payload(input, kind, GzEncoder::new(sink, Compression::default()))?;
            encoder.finish().context("finishing gzip stream")
        }
        CompressionMethod::Lz4 => {
            let encoder = write_payload(input, kind, FrameEncoder::new(sink))?;
            encoder
                .finish()
                .map_err(|e| anyhow::anyhow!("finishing lz4 stream: {e}"))
        }
    }
}

fn write_payload<W: Write>(input: &Path, kind: StashKind, mut sink: W) -> Result<W> {
    match kind {
        StashKind::Folder => {
            let mut builder = tar::Builder::new(sink);
            builder.follow_symlinks(false);
            builder
                .append_dir_all(".", input)
                .with_context(|| format!("archiving {}", input.display()))?;
            builder.into_inner().context("finishing tar stream")
        }
        StashKind::Object => {
            let mut file =
                File::open(input).with_context(|| format!("opening {}", input.display()))?;
            io::copy(&mut file, &mut sink).with_context(|| format!("reading {}", input.display()))?;
            Ok(sink)
        }
    }
}

/// Inverse of [`pack`]: decompress `reader` and materialise it at `out`.
///
/// Whatever the unpacker leaves unread (tar padding, trailing bytes) is
/// drained afterwards so the whole stream is consumed.
pub fn unpack<R: Read>(
    mut reader: R,
    kind: StashKind,
    compression: CompressionMethod,
    out: &Path,
) -> Result<Unpacked> {
    let unpacked = match compression {
        CompressionMethod::None => unpack_payload(&mut reader, kind, out)?,
        CompressionMethod::Gzip => unpack_payload(GzDecoder::new(&mut reader), kind, out)?,
        CompressionMethod::Lz4 => unpack_payload(FrameDecoder::new(&mut reader), kind, out)?,
    };
    let tail = io::copy(&mut reader, &mut io::sink()).context("draining stream tail")?;
    if tail > 0 {
        debug!(bytes = tail, "drained unread stream tail");
    }
    info!(out = %out.display(), files = unpacked.files, bytes = unpacked.bytes, "unpacked");
    Ok(unpacked)
}

fn unpack_payload<R: Read>(mut reader: R, kind: StashKind, out: &Path) -> Result<Unpacked> {
    match kind {
        StashKind::Folder => {
            fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
            let mut archive = tar::Archive::new(reader);
            let mut unpacked = Unpacked::default();
            for entry in archive.entries().context("reading tar stream")? {
                let mut entry = entry.context("reading tar entry")?;
                let is_file = entry.header().entry_type().is_file();
                let size = entry.size();
                entry
                    .unpack_in(out)
                    .with_context(|| format!("extracting into {}", out.display()))?;
                if is_file {
                    unpacked.files += 1;
                    unpacked.bytes += size;
                }
            }
            Ok(unpacked)
        }
        StashKind::Object => {
            if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let mut file = BufWriter::new(
                File::create(out).with_context(|| format!("creating {}", out.display()))?,
            );
            let bytes = io::copy(&mut reader, &mut file)
                .with_context(|| format!("writing {}", out.display()))?;
            file.flush()?;
            Ok(Unpacked { files: 1, bytes })
        }
    }
}
