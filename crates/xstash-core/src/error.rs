use std::io;

use thiserror::Error;

pub type StashResult<T> = Result<T, StashError>;

#[derive(Debug, Error)]
pub enum StashError {
    #[error("config error: {0}")]
    Config(String),

    #[error("authentication failed for chunk {index} ({file}): wrong passphrase or corrupted data")]
    Authentication { index: usize, file: String },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StashError {
    /// Recover a `StashError` that was boxed into an `io::Error` while
    /// crossing a `Read`/`Write` boundary. Plain I/O errors stay `Io`.
    pub fn from_io(err: io::Error) -> Self {
        let wraps_stash = err
            .get_ref()
            .is_some_and(|inner| inner.is::<StashError>());
        if !wraps_stash {
            return StashError::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<StashError>()) {
            Some(Ok(stash)) => *stash,
            Some(Err(other)) => StashError::Io(io::Error::new(kind, other)),
            None => StashError::Io(io::Error::from(kind)),
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, StashError::Authentication { .. })
    }
}

impl From<StashError> for io::Error {
    fn from(err: StashError) -> Self {
        match err {
            StashError::Io(inner) => inner,
            StashError::Authentication { .. } | StashError::Manifest(_) => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_boundary_preserves_class() {
        let original = StashError::Authentication {
            index: 3,
            file: "abc.xpart".into(),
        };
        let crossed: io::Error = original.into();
        assert_eq!(crossed.kind(), io::ErrorKind::InvalidData);

        let recovered = StashError::from_io(crossed);
        match recovered {
            StashError::Authentication { index, file } => {
                assert_eq!(index, 3);
                assert_eq!(file, "abc.xpart");
            }
            other => panic!("expected authentication error, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let err = io::Error::new(io::ErrorKind::NotFound, "missing chunk");
        let recovered = StashError::from_io(err);
        assert!(matches!(recovered, StashError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_io_variant_unwraps_directly() {
        let err: io::Error = StashError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "ro")).into();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}
