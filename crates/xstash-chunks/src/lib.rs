//! xstash-chunks: size-exact segmentation and ordered reassembly
//!
//! # Overview
//! - `segment`: cut a byte stream into fixed-size chunks (by size or by count)
//! - `transform`: ordered, labelled per-chunk transform stacks
//! - `reassemble`: a `Read` that drains chunk sources one after another
//!
//! ```text
//!   encode:  reader ──▶ Segmenter ──▶ Part{data, part, chunk} ──▶ TransformStack ──▶ chunk sink
//!   decode:  chunk sources ──▶ Reassembler(TransformStack) ──▶ Read
//! ```

pub mod reassemble;
pub mod segment;
pub mod transform;

pub use reassemble::{ChunkInput, Reassembler, SourceOpener};
pub use segment::{join_parts, ChunkMeta, Part, PartMeta, SegmentPlan, SegmentSpec, Segmenter};
pub use transform::{hand_over, ChunkTransform, Observe, TransformStack};
