//! Seekable byte sources for resumable uploads.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use drivestash_common::{Error, Result};

/// Supplies upload bytes and tracks a read position.
#[async_trait]
pub trait UploadSource: Send {
    /// Total number of bytes the upload declares.
    fn size(&self) -> u64;

    /// Offset the next read starts at.
    fn position(&self) -> u64;

    /// Move to an absolute byte offset.
    async fn seek(&mut self, offset: u64) -> Result<()>;

    /// Read up to `max` bytes. An empty result means the source is exhausted.
    async fn read(&mut self, max: usize) -> Result<Bytes>;
}

/// Upload source over an in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    position: u64,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }
}

#[async_trait]
impl UploadSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.size() {
            return Err(Error::InvalidInput(format!(
                "Seek to {} past end of {} byte source",
                offset,
                self.size()
            )));
        }
        self.position = offset;
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let start = self.position as usize;
        let end = (start + max).min(self.data.len());
        self.position = end as u64;
        Ok(self.data.slice(start..end))
    }
}

/// Upload source reading from a file on disk.
pub struct FileSource {
    file: File,
    size: u64,
    position: u64,
}

impl FileSource {
    /// Open a file for upload.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            file,
            size,
            position: 0,
        })
    }
}

#[async_trait]
impl UploadSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, offset: u64) -> Result<()> {
        self.position = self.file.seek(SeekFrom::Start(offset)).await?;
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; max];
        let mut filled = 0;
        while filled < max {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.position += filled as u64;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_reads_and_seeks() {
        let mut source = MemorySource::new(b"0123456789".to_vec());
        assert_eq!(source.size(), 10);

        assert_eq!(source.read(4).await.unwrap(), Bytes::from_static(b"0123"));
        assert_eq!(source.position(), 4);

        source.seek(8).await.unwrap();
        assert_eq!(source.read(4).await.unwrap(), Bytes::from_static(b"89"));
        assert!(source.read(4).await.unwrap().is_empty());

        assert!(source.seek(11).await.is_err());
    }

    #[tokio::test]
    async fn test_file_source_reads_and_seeks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.tar");
        tokio::fs::write(&path, vec![7u8; 1000]).await.unwrap();

        let mut source = FileSource::open(&path).await.unwrap();
        assert_eq!(source.size(), 1000);

        let chunk = source.read(600).await.unwrap();
        assert_eq!(chunk.len(), 600);
        assert_eq!(source.position(), 600);

        source.seek(900).await.unwrap();
        assert_eq!(source.read(600).await.unwrap().len(), 100);
        assert_eq!(source.position(), 1000);
    }
}
