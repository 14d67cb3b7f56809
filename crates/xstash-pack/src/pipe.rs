//! Bounded in-process pipe: a `Write` on a worker thread feeding a `Read`
//!
//! The writer must call [`PipeWriter::finish`] (or [`PipeWriter::fail`]);
//! a reader that sees the channel close without either reports
//! `UnexpectedEof` instead of a silently short stream.

use std::io::{self, Read, Write};

use crossbeam::channel::{bounded, Receiver, Sender};

enum Frame {
    Data(Vec<u8>),
    Done,
    Failed(io::Error),
}

/// Create a pipe holding at most `depth` frames of `frame_size` bytes.
pub fn pipe(depth: usize, frame_size: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(depth.max(1));
    (
        PipeWriter {
            tx,
            buf: Vec::with_capacity(frame_size),
            frame_size: frame_size.max(1),
        },
        PipeReader {
            rx,
            frame: Vec::new(),
            pos: 0,
            done: false,
        },
    )
}

pub struct PipeWriter {
    tx: Sender<Frame>,
    buf: Vec<u8>,
    frame_size: usize,
}

impl PipeWriter {
    fn send(&self, frame: Frame) -> io::Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader went away"))
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let frame = std::mem::replace(&mut self.buf, Vec::with_capacity(self.frame_size));
        self.send(Frame::Data(frame))
    }

    /// Mark the stream complete.
    pub fn finish(mut self) -> io::Result<()> {
        self.send_buffered()?;
        self.send(Frame::Done)
    }

    /// Hand an error to the reader side.
    pub fn fail(self, err: io::Error) {
        // reader may already be gone; nothing left to report to
        let _ = self.send(Frame::Failed(err));
    }

    /// A second handle for reporting failures after the writer was consumed.
    pub fn error_handle(&self) -> PipeErrorHandle {
        PipeErrorHandle {
            tx: self.tx.clone(),
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.frame_size - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == self.frame_size {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

pub struct PipeErrorHandle {
    tx: Sender<Frame>,
}

impl PipeErrorHandle {
    pub fn fail(self, err: io::Error) {
        let _ = self.tx.send(Frame::Failed(err));
    }
}

pub struct PipeReader {
    rx: Receiver<Frame>,
    frame: Vec<u8>,
    pos: usize,
    done: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.frame.len() {
                let n = buf.len().min(self.frame.len() - self.pos);
                buf[..n].copy_from_slice(&self.frame[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done || buf.is_empty() {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Frame::Data(frame)) => {
                    self.frame = frame;
                    self.pos = 0;
                }
                Ok(Frame::Done) => self.done = true,
                Ok(Frame::Failed(err)) => return Err(err),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "packer stopped before finishing the stream",
                    ))
                }
            }
        }
    }
}
