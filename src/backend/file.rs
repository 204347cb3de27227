//! Local filesystem backend, handy for tests and as a mock object store.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};
use crate::source::{StreamAtResponse, StreamSource};

/// Serves objects from files under a root directory; the object key is the
/// path relative to the root.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl StreamSource for FileBackend {
    async fn stream_at(&self, key: &str, offset: u64, len: u64) -> Result<StreamAtResponse> {
        let path = self.path_for(key);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata().await?.len();
        if offset >= size {
            return Ok(StreamAtResponse::past_end(Some(size)));
        }
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(StreamAtResponse {
            body: Some(Box::new(file.take(len.min(size - offset)))),
            total_size: Some(size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(body: &mut crate::source::SourceBody) -> Vec<u8> {
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_stream_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("obj"), b"hello block world").unwrap();
        let backend = FileBackend::new(dir.path());

        let response = backend.stream_at("obj", 6, 5).await.unwrap();
        assert_eq!(response.total_size, Some(17));
        assert_eq!(read_all(&mut response.body.unwrap()).await, b"block");
    }

    #[tokio::test]
    async fn test_stream_clamps_at_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("obj"), b"0123456789").unwrap();
        let backend = FileBackend::new(dir.path());

        let response = backend.stream_at("obj", 8, 100).await.unwrap();
        assert_eq!(read_all(&mut response.body.unwrap()).await, b"89");

        let response = backend.stream_at("obj", 10, 1).await.unwrap();
        assert!(response.body.is_none());
        assert_eq!(response.total_size, Some(10));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        let err = backend.stream_at("nope", 0, 1).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
