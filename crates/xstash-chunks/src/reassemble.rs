//! Pull-driven reassembly of chunk sources into one stream
//!
//! [`Reassembler`] implements [`std::io::Read`]. Each chunk source is opened
//! only when the previous one is drained, and every byte passes through the
//! per-chunk [`TransformStack`] before the consumer sees it. The first error
//! from a source or a stage aborts the stream; bytes already handed out are
//! not taken back.

use std::collections::VecDeque;
use std::io::{self, Read};

use tracing::{debug, trace};
use xstash_core::{StashError, StashResult};

use crate::transform::TransformStack;

/// Opens the byte source of one chunk.
pub type SourceOpener = Box<dyn FnOnce() -> io::Result<Box<dyn Read + Send>> + Send>;

/// One chunk to reassemble: its context plus a lazy source.
pub struct ChunkInput<M> {
    pub meta: M,
    pub open: SourceOpener,
}

impl<M> ChunkInput<M> {
    pub fn new(
        meta: M,
        open: impl FnOnce() -> io::Result<Box<dyn Read + Send>> + Send + 'static,
    ) -> Self {
        Self {
            meta,
            open: Box::new(open),
        }
    }
}

struct Active<M> {
    meta: M,
    source: Box<dyn Read + Send>,
}

pub struct Reassembler<M> {
    pending: VecDeque<ChunkInput<M>>,
    active: Option<Active<M>>,
    stack: TransformStack<M>,
    read_buf: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    chunks_done: usize,
    failed: bool,
}

impl<M> Reassembler<M> {
    /// Default read size requested from each chunk source.
    pub const DEFAULT_READ_SIZE: usize = 64 * 1024;

    /// `inputs` must already be in stream order.
    pub fn new(inputs: impl IntoIterator<Item = ChunkInput<M>>, stack: TransformStack<M>) -> Self {
        Self::with_read_size(inputs, stack, Self::DEFAULT_READ_SIZE)
    }

    pub fn with_read_size(
        inputs: impl IntoIterator<Item = ChunkInput<M>>,
        stack: TransformStack<M>,
        read_size: usize,
    ) -> Self {
        Self {
            pending: inputs.into_iter().collect(),
            active: None,
            stack,
            read_buf: vec![0u8; read_size.max(1)],
            out: Vec::new(),
            out_pos: 0,
            chunks_done: 0,
            failed: false,
        }
    }

    /// Chunks fully drained so far.
    pub fn chunks_done(&self) -> usize {
        self.chunks_done
    }

    /// Chunks not yet opened.
    pub fn chunks_pending(&self) -> usize {
        self.pending.len()
    }

    /// Move more bytes into `out`. Returns `false` once every source is done.
    fn pump(&mut self) -> StashResult<bool> {
        if self.active.is_none() {
            let Some(input) = self.pending.pop_front() else {
                return Ok(false);
            };
            self.active = Some(self.open(input)?);
        }
        let Some(active) = self.active.as_mut() else {
            return Ok(false);
        };

        let n = loop {
            match active.source.read(&mut self.read_buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StashError::from_io(e)),
            }
        };

        if n == 0 {
            self.stack.finish(&mut active.meta, &mut self.out)?;
            self.active = None;
            self.chunks_done += 1;
            trace!(chunk = self.chunks_done - 1, "chunk source drained");
        } else {
            self.stack
                .update(&mut active.meta, &self.read_buf[..n], &mut self.out)?;
        }
        Ok(true)
    }

    fn open(&mut self, input: ChunkInput<M>) -> StashResult<Active<M>> {
        let ChunkInput { mut meta, open } = input;
        debug!(chunk = self.chunks_done, "opening chunk source");
        let source = open().map_err(StashError::from_io)?;
        self.stack.begin(&mut meta)?;
        Ok(Active { meta, source })
    }
}

impl<M> Read for Reassembler<M> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.out_pos < self.out.len() {
                let n = buf.len().min(self.out.len() - self.out_pos);
                buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
                self.out_pos += n;
                return Ok(n);
            }
            self.out.clear();
            self.out_pos = 0;

            if self.failed {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "reassembly aborted by an earlier error",
                ));
            }
            match self.pump() {
                Ok(true) => continue,
                Ok(false) => return Ok(0),
                Err(e) => {
                    self.failed = true;
                    self.active = None;
                    return Err(e.into());
                }
            }
        }
    }
}
