//! Chunk file names
//!
//! Random names (64 hex chars + `.xpart`) by default. A template may use
//! `{index}`, `{number}`, `{padded_index}` and `{padded_number}`.

use rand::RngCore;
use xstash_chunks::ChunkMeta;
use xstash_core::{StashError, StashResult, CHUNK_EXTENSION, MANIFEST_FILE};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChunkNaming {
    #[default]
    Random,
    Template(Vec<Segment>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Index,
    Number,
    PaddedIndex,
    PaddedNumber,
}

impl ChunkNaming {
    /// Parse a template. It must reference at least one chunk field so that
    /// every chunk gets a distinct name.
    pub fn template(template: &str) -> StashResult<Self> {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                StashError::Config(format!("unclosed placeholder in chunk name template {template:?}"))
            })?;
            segments.push(match &after[..close] {
                "index" => Segment::Index,
                "number" => Segment::Number,
                "padded_index" => Segment::PaddedIndex,
                "padded_number" => Segment::PaddedNumber,
                other => {
                    return Err(StashError::Config(format!(
                        "unknown placeholder {{{other}}} in chunk name template"
                    )))
                }
            });
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        if !segments.iter().any(|s| !matches!(s, Segment::Literal(_))) {
            return Err(StashError::Config(format!(
                "chunk name template {template:?} has no placeholder, every chunk would share one name"
            )));
        }
        let literal: String = segments
            .iter()
            .filter_map(|s| match s {
                Segment::Literal(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if literal.contains(['/', '\\', '\0']) {
            return Err(StashError::Config(format!(
                "chunk name template {template:?} must not contain path separators"
            )));
        }
        Ok(ChunkNaming::Template(segments))
    }

    pub fn from_config(template: Option<&str>) -> StashResult<Self> {
        template.map_or(Ok(ChunkNaming::Random), Self::template)
    }

    pub fn name(&self, chunk: &ChunkMeta) -> StashResult<String> {
        let name = match self {
            ChunkNaming::Random => {
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                format!("{}.{CHUNK_EXTENSION}", hex::encode(bytes))
            }
            ChunkNaming::Template(segments) => {
                let mut name = String::new();
                for segment in segments {
                    match segment {
                        Segment::Literal(text) => name.push_str(text),
                        Segment::Index => name.push_str(&chunk.index.to_string()),
                        Segment::Number => name.push_str(&chunk.number.to_string()),
                        Segment::PaddedIndex => name.push_str(&chunk.padded_index),
                        Segment::PaddedNumber => name.push_str(&chunk.padded_number),
                    }
                }
                name
            }
        };
        if name == MANIFEST_FILE || name == "." || name == ".." {
            return Err(StashError::Config(format!("chunk name {name:?} is reserved")));
        }
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xstash_chunks::{SegmentSpec, Segmenter};

    fn metas(count: u64) -> Vec<ChunkMeta> {
        let mut segmenter = Segmenter::new(&SegmentSpec::by_size(1, Some(count))).unwrap();
        segmenter
            .feed(vec![0u8; count as usize])
            .unwrap()
            .into_iter()
            .map(|p| p.chunk)
            .collect()
    }

    #[test]
    fn test_random_names() {
        let meta = &metas(1)[0];
        let a = ChunkNaming::Random.name(meta).unwrap();
        let b = ChunkNaming::Random.name(meta).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64 + 1 + CHUNK_EXTENSION.len());
        assert!(a.ends_with(".xpart"));
    }

    #[test]
    fn test_template_renders_fields() {
        let naming = ChunkNaming::template("part-{padded_number}-of-{number}.bin").unwrap();
        let metas = metas(12);
        assert_eq!(naming.name(&metas[0]).unwrap(), "part-01-of-1.bin");
        assert_eq!(naming.name(&metas[11]).unwrap(), "part-12-of-12.bin");

        let naming = ChunkNaming::template("{padded_index}").unwrap();
        assert_eq!(naming.name(&metas[3]).unwrap(), "03");
    }

    #[test]
    fn test_template_errors() {
        assert!(ChunkNaming::template("static.xpart").is_err());
        assert!(ChunkNaming::template("part-{size}").is_err());
        assert!(ChunkNaming::template("part-{index").is_err());
        assert!(ChunkNaming::template("sub/{index}").is_err());
    }

    #[test]
    fn test_from_config() {
        assert_eq!(ChunkNaming::from_config(None).unwrap(), ChunkNaming::Random);
        assert!(matches!(
            ChunkNaming::from_config(Some("{number}.xpart")).unwrap(),
            ChunkNaming::Template(_)
        ));
    }
}
