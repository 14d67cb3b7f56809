//! Size-exact segmentation of a byte stream
//!
//! Cuts an arbitrary sequence of input buffers into ordered chunks whose
//! sizes are fixed up front, either by an explicit byte size or by a chunk
//! count over a known total:
//!
//! ```text
//!   total = 17, size = 5, append_overflow = true   ->  [5, 5, 7]
//!   total = 17, size = 5, append_overflow = false  ->  [5, 5, 5, 2]
//!   total unknown, size = 5                        ->  [5, 5, ..., rest]
//! ```
//!
//! Every input buffer yields zero or more [`Part`]s. A part never spans a
//! chunk boundary, so a consumer can open one chunk sink per
//! [`ChunkMeta::index`] and close it on [`PartMeta::is_final_part`].

use bytes::{Bytes, BytesMut};
use xstash_core::{StashError, StashResult};

/// How the stream should be cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpec {
    /// Explicit chunk size in bytes (takes precedence over `chunk_count`)
    pub chunk_size: Option<u64>,
    /// Number of chunks to cut a known total into
    pub chunk_count: Option<u64>,
    /// Total stream length; `None` means unknown (streaming)
    pub total_size: Option<u64>,
    /// Fold the remainder into the last chunk instead of emitting a short one
    pub append_overflow: bool,
}

impl SegmentSpec {
    pub fn by_size(chunk_size: u64, total_size: Option<u64>) -> Self {
        Self {
            chunk_size: Some(chunk_size),
            chunk_count: None,
            total_size,
            append_overflow: true,
        }
    }

    pub fn by_count(chunk_count: u64, total_size: u64) -> Self {
        Self {
            chunk_size: None,
            chunk_count: Some(chunk_count),
            total_size: Some(total_size),
            append_overflow: true,
        }
    }

    pub fn with_append_overflow(mut self, append_overflow: bool) -> Self {
        self.append_overflow = append_overflow;
        self
    }
}

/// Chunk geometry resolved from a [`SegmentSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    chunk_size: u64,
    total_size: Option<u64>,
    number_of_parts: u64,
    last_chunk_size: u64,
    pad_width: usize,
}

impl SegmentPlan {
    /// Resolve chunk size and count. Fails before any data is seen when no
    /// size can be derived or the derived size is below one byte.
    pub fn resolve(spec: &SegmentSpec) -> StashResult<Self> {
        let (chunk_size, append_overflow) = match (spec.chunk_size, spec.chunk_count) {
            (Some(size), _) => (size, spec.append_overflow),
            (None, Some(count)) => {
                let total = spec.total_size.ok_or_else(|| {
                    StashError::Config(
                        "a chunk count needs a known total size; use an explicit chunk size for streaming input"
                            .into(),
                    )
                })?;
                if count == 0 {
                    return Err(StashError::Config("chunk count must be at least 1".into()));
                }
                if total == 0 {
                    return Ok(Self::empty(1));
                }
                // Count mode always folds the remainder so the count holds.
                (total / count, true)
            }
            (None, None) => {
                return Err(StashError::Config(
                    "cannot determine chunk size: neither a chunk size nor a chunk count was given"
                        .into(),
                ))
            }
        };

        if chunk_size < 1 {
            return Err(StashError::Config(format!(
                "chunk size resolved to {chunk_size} bytes, must be at least 1"
            )));
        }

        match spec.total_size {
            None => Ok(Self {
                chunk_size,
                total_size: None,
                number_of_parts: 0,
                last_chunk_size: chunk_size,
                pad_width: 0,
            }),
            Some(0) => Ok(Self::empty(chunk_size)),
            Some(total) => {
                let number_of_parts = if append_overflow {
                    (total / chunk_size).max(1)
                } else {
                    total.div_ceil(chunk_size)
                };
                let last_chunk_size = total - (number_of_parts - 1) * chunk_size;
                Ok(Self {
                    chunk_size: chunk_size.min(total),
                    total_size: Some(total),
                    number_of_parts,
                    last_chunk_size,
                    pad_width: number_of_parts.to_string().len(),
                })
            }
        }
    }

    fn empty(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            total_size: Some(0),
            number_of_parts: 0,
            last_chunk_size: 0,
            pad_width: 1,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn is_streaming(&self) -> bool {
        self.total_size.is_none()
    }

    /// Number of chunks, `None` when streaming.
    pub fn number_of_parts(&self) -> Option<u64> {
        self.total_size.map(|_| self.number_of_parts)
    }

    pub fn last_chunk_size(&self) -> Option<u64> {
        self.total_size.map(|_| self.last_chunk_size)
    }

    /// Expected size of every chunk, in order. Empty when streaming.
    pub fn chunk_sizes(&self) -> Vec<u64> {
        (0..self.number_of_parts)
            .map(|index| self.target_size(index))
            .collect()
    }

    fn target_size(&self, index: u64) -> u64 {
        if self.is_final_chunk(index) {
            self.last_chunk_size
        } else {
            self.chunk_size
        }
    }

    fn is_final_chunk(&self, index: u64) -> bool {
        self.total_size.is_some() && index + 1 == self.number_of_parts
    }

    fn chunk_meta(&self, index: u64, target_size: u64, is_final: bool) -> ChunkMeta {
        let number = index + 1;
        let width = self.pad_width;
        ChunkMeta {
            target_size,
            is_final,
            index,
            number,
            padded_index: format!("{index:0width$}"),
            padded_number: format!("{number:0width$}"),
        }
    }
}

/// Position of a part within its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartMeta {
    pub size: usize,
    pub remaining_in_chunk: u64,
    pub is_final_part: bool,
}

/// The chunk a part belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Bytes this chunk is expected to hold
    pub target_size: u64,
    /// Last chunk of the stream
    pub is_final: bool,
    /// 0-based position
    pub index: u64,
    /// 1-based position
    pub number: u64,
    /// `index` zero-padded to the digit count of the chunk total
    pub padded_index: String,
    /// `number` zero-padded to the digit count of the chunk total
    pub padded_number: String,
}

/// One slice of input, never crossing a chunk boundary.
#[derive(Debug, Clone)]
pub struct Part {
    pub data: Bytes,
    pub part: PartMeta,
    pub chunk: ChunkMeta,
}

/// Stateful segmenter: feed buffers in, take parts out.
///
/// With a known total, parts are emitted as soon as their bytes arrive.
/// With an unknown total the most recent part is held back until more
/// input (or [`Segmenter::finish`]) shows whether it ends the stream, so
/// the last part emitted is always flagged final.
#[derive(Debug)]
pub struct Segmenter {
    plan: SegmentPlan,
    overflow: Option<Part>,
    bytes_read: u64,
    chunk_bytes_read: u64,
    index: u64,
    finished: bool,
}

impl Segmenter {
    pub fn new(spec: &SegmentSpec) -> StashResult<Self> {
        Ok(Self::with_plan(SegmentPlan::resolve(spec)?))
    }

    pub fn with_plan(plan: SegmentPlan) -> Self {
        Self {
            plan,
            overflow: None,
            bytes_read: 0,
            chunk_bytes_read: 0,
            index: 0,
            finished: false,
        }
    }

    pub fn plan(&self) -> &SegmentPlan {
        &self.plan
    }

    /// Total bytes accepted so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Slice `input` into parts.
    pub fn feed(&mut self, input: impl Into<Bytes>) -> StashResult<Vec<Part>> {
        if self.finished {
            return Err(StashError::Stream("segmenter fed after finish".into()));
        }
        let mut data: Bytes = input.into();
        let mut parts = Vec::new();

        while !data.is_empty() {
            let (target, is_final) = match self.plan.total_size {
                Some(total) => {
                    if self.index >= self.plan.number_of_parts {
                        return Err(StashError::Stream(format!(
                            "input exceeds the declared total of {total} bytes"
                        )));
                    }
                    (
                        self.plan.target_size(self.index),
                        self.plan.is_final_chunk(self.index),
                    )
                }
                None => (self.plan.chunk_size, false),
            };

            let want = target - self.chunk_bytes_read;
            let take = want.min(data.len() as u64) as usize;
            let slice = data.split_to(take);
            let part = self.cut(slice, target, is_final);

            if self.plan.is_streaming() {
                if let Some(held) = self.overflow.replace(part) {
                    parts.push(held);
                }
            } else {
                parts.push(part);
            }
        }

        Ok(parts)
    }

    /// Signal end of input and release whatever is still held.
    ///
    /// Fails when a declared total was not reached.
    pub fn finish(&mut self) -> StashResult<Vec<Part>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;

        if let Some(total) = self.plan.total_size {
            if self.bytes_read != total {
                return Err(StashError::Stream(format!(
                    "stream ended after {} of {total} declared bytes",
                    self.bytes_read
                )));
            }
            return Ok(Vec::new());
        }

        Ok(self
            .overflow
            .take()
            .map(|mut last| {
                let chunk_size = last.chunk.target_size - last.part.remaining_in_chunk;
                last.part.remaining_in_chunk = 0;
                last.part.is_final_part = true;
                last.chunk.target_size = chunk_size;
                last.chunk.is_final = true;
                vec![last]
            })
            .unwrap_or_default())
    }

    fn cut(&mut self, data: Bytes, target: u64, is_final: bool) -> Part {
        let size = data.len();
        self.bytes_read += size as u64;
        self.chunk_bytes_read += size as u64;

        let remaining_in_chunk = target - self.chunk_bytes_read;
        let part = Part {
            data,
            part: PartMeta {
                size,
                remaining_in_chunk,
                is_final_part: remaining_in_chunk == 0,
            },
            chunk: self.plan.chunk_meta(self.index, target, is_final),
        };

        if remaining_in_chunk == 0 {
            self.chunk_bytes_read = 0;
            self.index += 1;
        }
        part
    }
}

/// Concatenate part payloads back together; handy for consumers that want
/// a whole chunk at once.
pub fn join_parts<'a>(parts: impl IntoIterator<Item = &'a Part>) -> Bytes {
    let mut buf = BytesMut::new();
    for part in parts {
        buf.extend_from_slice(&part.data);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(spec: SegmentSpec, data: &[u8], buffer: usize) -> Vec<Part> {
        let mut segmenter = Segmenter::new(&spec).unwrap();
        let mut parts = Vec::new();
        for piece in data.chunks(buffer.max(1)) {
            parts.extend(segmenter.feed(piece.to_vec()).unwrap());
        }
        parts.extend(segmenter.finish().unwrap());
        parts
    }

    fn chunk_sizes(parts: &[Part]) -> Vec<u64> {
        let mut sizes: Vec<u64> = Vec::new();
        for part in parts {
            let index = part.chunk.index as usize;
            if sizes.len() <= index {
                sizes.push(0);
            }
            sizes[index] += part.part.size as u64;
        }
        sizes
    }

    #[test]
    fn test_append_overflow_folds_remainder() {
        let plan = SegmentPlan::resolve(&SegmentSpec::by_size(5, Some(17))).unwrap();
        assert_eq!(plan.number_of_parts(), Some(3));
        assert_eq!(plan.chunk_sizes(), vec![5, 5, 7]);

        let parts = run(SegmentSpec::by_size(5, Some(17)), &[7u8; 17], 4);
        assert_eq!(chunk_sizes(&parts), vec![5, 5, 7]);
    }

    #[test]
    fn test_no_append_overflow_emits_short_chunk() {
        let spec = SegmentSpec::by_size(5, Some(17)).with_append_overflow(false);
        let plan = SegmentPlan::resolve(&spec).unwrap();
        assert_eq!(plan.number_of_parts(), Some(4));
        assert_eq!(plan.chunk_sizes(), vec![5, 5, 5, 2]);

        let parts = run(spec, &[7u8; 17], 3);
        assert_eq!(chunk_sizes(&parts), vec![5, 5, 5, 2]);
    }

    #[test]
    fn test_exact_multiple_without_overflow() {
        let spec = SegmentSpec::by_size(5, Some(20)).with_append_overflow(false);
        let plan = SegmentPlan::resolve(&spec).unwrap();
        assert_eq!(plan.chunk_sizes(), vec![5, 5, 5, 5]);
    }

    #[test]
    fn test_count_mode_divides_total() {
        let plan = SegmentPlan::resolve(&SegmentSpec::by_count(4, 1 << 20)).unwrap();
        assert_eq!(plan.number_of_parts(), Some(4));
        assert_eq!(plan.chunk_sizes(), vec![1 << 18; 4]);
    }

    #[test]
    fn test_count_mode_forces_append_overflow() {
        let spec = SegmentSpec::by_count(4, 17).with_append_overflow(false);
        let plan = SegmentPlan::resolve(&spec).unwrap();
        assert_eq!(plan.chunk_sizes(), vec![4, 4, 4, 5]);
    }

    #[test]
    fn test_total_smaller_than_chunk() {
        let plan = SegmentPlan::resolve(&SegmentSpec::by_size(100, Some(3))).unwrap();
        assert_eq!(plan.chunk_sizes(), vec![3]);
        assert_eq!(plan.chunk_size(), 3);
    }

    #[test]
    fn test_config_errors_before_data() {
        let none = SegmentSpec {
            chunk_size: None,
            chunk_count: None,
            total_size: Some(10),
            append_overflow: true,
        };
        assert!(matches!(Segmenter::new(&none), Err(StashError::Config(_))));
        assert!(matches!(
            Segmenter::new(&SegmentSpec::by_size(0, Some(10))),
            Err(StashError::Config(_))
        ));
        // more chunks than bytes resolves to a zero chunk size
        assert!(matches!(
            Segmenter::new(&SegmentSpec::by_count(11, 10)),
            Err(StashError::Config(_))
        ));
        let streaming_count = SegmentSpec {
            total_size: None,
            ..SegmentSpec::by_count(4, 0)
        };
        assert!(matches!(
            Segmenter::new(&streaming_count),
            Err(StashError::Config(_))
        ));
    }

    #[test]
    fn test_empty_total_emits_nothing() {
        let parts = run(SegmentSpec::by_count(4, 0), &[], 8);
        assert!(parts.is_empty());
    }

    #[test]
    fn test_chunk_meta_padding() {
        let parts = run(SegmentSpec::by_size(1, Some(12)), &[0u8; 12], 5);
        assert_eq!(parts.len(), 12);
        assert_eq!(parts[0].chunk.padded_index, "00");
        assert_eq!(parts[0].chunk.padded_number, "01");
        assert_eq!(parts[11].chunk.padded_index, "11");
        assert_eq!(parts[11].chunk.number, 12);
        assert!(parts[11].chunk.is_final);
        assert!(!parts[10].chunk.is_final);
    }

    #[test]
    fn test_part_meta_tracks_remaining() {
        let parts = run(SegmentSpec::by_size(5, Some(10)), &[1u8; 10], 2);
        let first_chunk: Vec<_> = parts.iter().filter(|p| p.chunk.index == 0).collect();
        assert_eq!(
            first_chunk.iter().map(|p| p.part.remaining_in_chunk).collect::<Vec<_>>(),
            vec![3, 1, 0]
        );
        assert!(first_chunk[2].part.is_final_part);
        assert!(!first_chunk[1].part.is_final_part);
    }

    #[test]
    fn test_overrun_is_stream_error() {
        let mut segmenter = Segmenter::new(&SegmentSpec::by_size(4, Some(8))).unwrap();
        segmenter.feed(vec![0u8; 8]).unwrap();
        assert!(matches!(segmenter.feed(vec![0u8; 1]), Err(StashError::Stream(_))));
    }

    #[test]
    fn test_short_input_is_stream_error() {
        let mut segmenter = Segmenter::new(&SegmentSpec::by_size(4, Some(8))).unwrap();
        segmenter.feed(vec![0u8; 5]).unwrap();
        assert!(matches!(segmenter.finish(), Err(StashError::Stream(_))));
    }

    #[test]
    fn test_streaming_marks_last_part_final() {
        let parts = run(SegmentSpec::by_size(4, None), &[9u8; 10], 3);
        assert_eq!(chunk_sizes(&parts), vec![4, 4, 2]);
        let last = parts.last().unwrap();
        assert!(last.chunk.is_final);
        assert!(last.part.is_final_part);
        assert_eq!(last.chunk.target_size, 2);
        assert!(parts[..parts.len() - 1].iter().all(|p| !p.chunk.is_final));
    }

    #[test]
    fn test_streaming_ending_on_boundary() {
        let parts = run(SegmentSpec::by_size(4, None), &[9u8; 8], 8);
        assert_eq!(chunk_sizes(&parts), vec![4, 4]);
        let last = parts.last().unwrap();
        assert!(last.chunk.is_final);
        assert_eq!(last.chunk.target_size, 4);
        assert_eq!(last.chunk.padded_number, "2");
    }

    #[test]
    fn test_streaming_empty_input() {
        let parts = run(SegmentSpec::by_size(4, None), &[], 8);
        assert!(parts.is_empty());
    }

    proptest! {
        #[test]
        fn parts_cover_input_in_order(
            data in proptest::collection::vec(any::<u8>(), 1..=4096),
            chunk_size in 1u64..=512,
            buffer in 1usize..=700,
            append_overflow in any::<bool>(),
            streaming in any::<bool>(),
        ) {
            let total = if streaming { None } else { Some(data.len() as u64) };
            let spec = SegmentSpec::by_size(chunk_size, total).with_append_overflow(append_overflow);
            let parts = run(spec, &data, buffer);

            let joined = join_parts(&parts);
            prop_assert_eq!(joined.as_ref(), data.as_slice());

            let mut last_index = 0;
            for part in &parts {
                prop_assert!(part.chunk.index >= last_index, "indices must not decrease");
                last_index = part.chunk.index;
            }

            let last = parts.last().unwrap();
            prop_assert!(last.chunk.is_final && last.part.is_final_part);

            let sizes = chunk_sizes(&parts);
            if let Some(total) = total {
                let plan = SegmentPlan::resolve(&spec).unwrap();
                prop_assert_eq!(&sizes, &plan.chunk_sizes());
                prop_assert_eq!(sizes.iter().sum::<u64>(), total);
            } else {
                for size in &sizes[..sizes.len() - 1] {
                    prop_assert_eq!(*size, chunk_size);
                }
            }
        }
    }
}
