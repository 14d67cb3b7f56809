use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StashError;

/// What the stashed byte stream holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StashKind {
    /// A tar archive of a directory tree
    Folder,
    /// The raw bytes of a single file
    Object,
}

/// Compression applied to the stream before segmentation.
///
/// Serialized as the numeric id stored in the manifest's `compress.id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CompressionMethod {
    None,
    #[default]
    Gzip,
    Lz4,
}

impl CompressionMethod {
    pub fn id(self) -> u8 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Gzip => 1,
            CompressionMethod::Lz4 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Gzip => "gzip",
            CompressionMethod::Lz4 => "lz4",
        }
    }
}

impl TryFrom<u8> for CompressionMethod {
    type Error = StashError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Gzip),
            2 => Ok(CompressionMethod::Lz4),
            other => Err(StashError::Manifest(format!(
                "unknown compression id {other}"
            ))),
        }
    }
}

impl From<CompressionMethod> for u8 {
    fn from(method: CompressionMethod) -> u8 {
        method.id()
    }
}

impl FromStr for CompressionMethod {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(CompressionMethod::None),
            "gzip" | "gz" => Ok(CompressionMethod::Gzip),
            "lz4" => Ok(CompressionMethod::Lz4),
            other => Err(StashError::Config(format!(
                "unknown compression method: {other} (expected none, gzip or lz4)"
            ))),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for StashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StashKind::Folder => f.write_str("folder"),
            StashKind::Object => f.write_str("object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_ids() {
        for method in [
            CompressionMethod::None,
            CompressionMethod::Gzip,
            CompressionMethod::Lz4,
        ] {
            assert_eq!(CompressionMethod::try_from(method.id()).unwrap(), method);
        }
        assert!(CompressionMethod::try_from(7).is_err());
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("LZ4".parse::<CompressionMethod>().unwrap(), CompressionMethod::Lz4);
        assert_eq!("gz".parse::<CompressionMethod>().unwrap(), CompressionMethod::Gzip);
        assert!("brotli".parse::<CompressionMethod>().is_err());
    }

    #[test]
    fn test_kind_is_lowercase_in_toml() {
        let toml_str = "kind = \"folder\"";
        #[derive(Deserialize)]
        struct Doc {
            kind: StashKind,
        }
        let doc: Doc = toml::from_str(toml_str).unwrap();
        assert_eq!(doc.kind, StashKind::Folder);
    }
}
