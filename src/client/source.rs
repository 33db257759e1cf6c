//! File handles the client can upload: an in-memory buffer or a file on disk.

use bytes::Bytes;
use std::{
    io::{self, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

#[derive(Debug, Clone)]
enum Source {
    Memory(Bytes),
    Disk(PathBuf),
}

/// A named file with a known size.
///
/// Only the name and size are needed for validation; contents are read
/// lazily, one range at a time.
#[derive(Debug, Clone)]
pub struct UploadFile {
    name: String,
    size: u64,
    source: Source,
}

impl UploadFile {
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            source: Source::Memory(data),
        }
    }

    /// Open a file on disk. Only its metadata is read here.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                )
            })?
            .to_string();

        Ok(Self {
            name,
            size: meta.len(),
            source: Source::Disk(path.to_path_buf()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the bytes in `range`, clamped to the file size.
    pub async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let start = range.start.min(self.size);
        let end = range.end.min(self.size).max(start);
        match &self.source {
            Source::Memory(data) => Ok(data.slice(start as usize..end as usize)),
            Source::Disk(path) => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; (end - start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Read the whole file.
    pub async fn read_all(&self) -> io::Result<Bytes> {
        self.read_range(0..self.size).await
    }
}
