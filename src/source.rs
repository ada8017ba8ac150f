//! Byte sources feeding a connection's send path.
//!
//! A source produces a finite sequence of MTU-sized chunks and is restartable
//!  only by reopening it - good enough for the bulk-transfer use this protocol
//!  is built for.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::config::MTU_SIZE;

#[async_trait]
pub trait ChunkSource: Send {
    /// The next chunk of at most [MTU_SIZE] bytes, or `None` at the end of
    ///  the data. Every chunk except the last is exactly MTU-sized.
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>>;
}

/// Reads a file in MTU-sized chunks.
pub struct FileSource {
    file: File,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<FileSource> {
        Ok(FileSource {
            file: File::open(path).await?,
        })
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>> {
        let mut buf = vec![0u8; MTU_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf.into()))
    }
}

/// In-memory source, mostly for tests and small payloads.
pub struct BytesSource {
    remaining: Bytes,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> BytesSource {
        BytesSource {
            remaining: data.into(),
        }
    }
}

#[async_trait]
impl ChunkSource for BytesSource {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>> {
        if self.remaining.is_empty() {
            return Ok(None);
        }
        let n = self.remaining.len().min(MTU_SIZE);
        Ok(Some(self.remaining.split_to(n)))
    }
}
