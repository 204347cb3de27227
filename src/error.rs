//! Error types shared across the adapter and its storage backends.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The origin definitively reported that the object does not exist.
    /// Cached in the size cache, so repeat reads of the same key fail
    /// without touching the backend.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Invalid caller input: malformed option, bad seek target, malformed URI.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other backend failure, propagated verbatim.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::NotFound("k".to_string()).is_not_found());
        assert!(!Error::InvalidArgument("x".to_string()).is_not_found());
    }

    #[test]
    fn test_backend_error_preserves_message() {
        let err = Error::Backend(anyhow::anyhow!("pseudo-random error"));
        assert_eq!(err.to_string(), "pseudo-random error");
    }
}
