//! Per-chunk transform stacks
//!
//! A [`TransformStack`] is an ordered list of labelled [`ChunkTransform`]s.
//! Bytes of one chunk enter the first stage and leave the last; every stage
//! sees `begin` once per chunk, any number of `update` calls, then `finish`.
//! The label only shows up in logs.
//!
//! `M` is the per-chunk context handed to each stage. Stages may write to it
//! (e.g. a cipher recording its tag) so the caller can read results back
//! once the chunk is done.

use tracing::debug;
use xstash_core::StashResult;

pub trait ChunkTransform<M>: Send {
    /// Called before the first byte of a chunk.
    fn begin(&mut self, _meta: &mut M) -> StashResult<()> {
        Ok(())
    }

    /// Transform `input`, appending any output to `out`.
    fn update(&mut self, meta: &mut M, input: &[u8], out: &mut Vec<u8>) -> StashResult<()>;

    /// Flush whatever the stage still holds for this chunk.
    fn finish(&mut self, meta: &mut M, out: &mut Vec<u8>) -> StashResult<()>;
}

struct Stage<M> {
    label: String,
    transform: Box<dyn ChunkTransform<M>>,
}

pub struct TransformStack<M> {
    stages: Vec<Stage<M>>,
}

impl<M> Default for TransformStack<M> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<M> TransformStack<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage; stages run in registration order.
    pub fn push(&mut self, label: impl Into<String>, transform: Box<dyn ChunkTransform<M>>) -> &mut Self {
        self.stages.push(Stage {
            label: label.into(),
            transform,
        });
        self
    }

    pub fn labels(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.label.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn begin(&mut self, meta: &mut M) -> StashResult<()> {
        for stage in &mut self.stages {
            stage.transform.begin(meta).inspect_err(|e| {
                debug!(stage = %stage.label, error = %e, "transform begin failed");
            })?;
        }
        Ok(())
    }

    pub fn update(&mut self, meta: &mut M, input: &[u8], out: &mut Vec<u8>) -> StashResult<()> {
        let Some((last, head)) = self.stages.split_last_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        let mut carry = input.to_vec();
        for stage in head {
            let mut next = Vec::with_capacity(carry.len());
            stage.update(meta, &carry, &mut next)?;
            carry = next;
        }
        last.update(meta, &carry, out)
    }

    /// Finish every stage in order; output a stage produces while finishing
    /// still flows through the stages after it.
    pub fn finish(&mut self, meta: &mut M, out: &mut Vec<u8>) -> StashResult<()> {
        let mut carry = Vec::new();
        for stage in &mut self.stages {
            let mut next = Vec::new();
            if !carry.is_empty() {
                stage.update(meta, &carry, &mut next)?;
            }
            stage.finish(meta, &mut next)?;
            carry = next;
        }
        hand_over(&mut carry, out);
        Ok(())
    }
}

/// Move `src` to the end of `out`. When `out` is empty the allocation itself
/// changes hands, so a whole chunk is never held twice.
pub fn hand_over(src: &mut Vec<u8>, out: &mut Vec<u8>) {
    if out.is_empty() {
        std::mem::swap(src, out);
        src.clear();
    } else {
        out.append(src);
    }
}

impl<M> Stage<M> {
    fn update(&mut self, meta: &mut M, input: &[u8], out: &mut Vec<u8>) -> StashResult<()> {
        self.transform.update(meta, input, out).inspect_err(|e| {
            debug!(stage = %self.label, error = %e, "transform update failed");
        })
    }

    fn finish(&mut self, meta: &mut M, out: &mut Vec<u8>) -> StashResult<()> {
        self.transform.finish(meta, out).inspect_err(|e| {
            debug!(stage = %self.label, error = %e, "transform finish failed");
        })
    }
}

/// Pass-through stage that reports the byte count of everything it sees.
pub struct Observe<M> {
    on_bytes: Box<dyn FnMut(&M, u64) + Send>,
}

impl<M> Observe<M> {
    pub fn new(on_bytes: impl FnMut(&M, u64) + Send + 'static) -> Self {
        Self {
            on_bytes: Box::new(on_bytes),
        }
    }
}

impl<M> ChunkTransform<M> for Observe<M> {
    fn update(&mut self, meta: &mut M, input: &[u8], out: &mut Vec<u8>) -> StashResult<()> {
        (self.on_bytes)(meta, input.len() as u64);
        out.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, _meta: &mut M, _out: &mut Vec<u8>) -> StashResult<()> {
        Ok(())
    }
}
