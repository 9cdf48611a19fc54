//! Chunked file transfer over one data channel per file.
//!
//! Wire protocol per channel: one text frame carrying [`FileMetadata`] as
//! JSON, then the file body as binary frames of at most
//! [`CHUNK_SIZE`](crate::core::config::CHUNK_SIZE) bytes. The receiver closes
//! the channel once every byte is durably written; that close is the sender's
//! completion signal.

pub mod destination;
pub mod receiver;
pub mod sender;

pub use destination::{DirectoryDestination, FileDestination, FileSink};
pub use receiver::receive_file;
pub use sender::send_file;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// Progress of one file within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub index: usize,
    pub metadata: FileMetadata,
    pub transferred_bytes: u64,
    /// Durably written bytes; only tracked on the receiving side.
    pub written_bytes: Option<u64>,
}

impl Transfer {
    pub fn sending(index: usize, metadata: FileMetadata) -> Self {
        Self {
            index,
            metadata,
            transferred_bytes: 0,
            written_bytes: None,
        }
    }

    pub fn receiving(index: usize, metadata: FileMetadata) -> Self {
        Self {
            index,
            metadata,
            transferred_bytes: 0,
            written_bytes: Some(0),
        }
    }

    pub fn is_done(&self) -> bool {
        match self.written_bytes {
            Some(written) => written == self.metadata.size,
            None => self.transferred_bytes == self.metadata.size,
        }
    }

    pub fn apply(&mut self, progress: &TransferProgress) {
        self.transferred_bytes = progress.transferred_bytes;
        if progress.written_bytes.is_some() {
            self.written_bytes = progress.written_bytes;
        }
    }
}

/// Progress report emitted by the chunked sender and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub index: usize,
    pub transferred_bytes: u64,
    pub written_bytes: Option<u64>,
}

/// Where the bytes of an outgoing file come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path { path: PathBuf, metadata: FileMetadata },
    Memory { data: Bytes, metadata: FileMetadata },
}

impl FileSource {
    pub async fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let size = tokio::fs::metadata(&path).await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let metadata = FileMetadata {
            mime_type: guess_mime_type(&path).to_string(),
            name,
            size,
        };
        Ok(Self::Path { path, metadata })
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let data = data.into();
        let metadata = FileMetadata {
            mime_type: guess_mime_type(Path::new(&name)).to_string(),
            size: data.len() as u64,
            name,
        };
        Self::Memory { data, metadata }
    }

    pub fn metadata(&self) -> &FileMetadata {
        match self {
            Self::Path { metadata, .. } | Self::Memory { metadata, .. } => metadata,
        }
    }

    pub async fn open(&self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match self {
            Self::Path { path, .. } => Ok(Box::new(tokio::fs::File::open(path).await?)),
            Self::Memory { data, .. } => Ok(Box::new(Cursor::new(data.clone()))),
        }
    }
}

fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}
