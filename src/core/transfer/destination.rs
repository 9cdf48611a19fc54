//! Durable output for received files.
//!
//! A [`FileDestination`] is asked for a [`FileSink`] once the metadata frame
//! arrives. Sinks write into a partial file that only becomes visible under
//! its final name on [`FileSink::finalize`]; an aborted or dropped sink
//! leaves nothing behind.

use super::FileMetadata;
use crate::core::config::PART_FILE_SUFFIX;
use crate::core::error::PersistenceError;
use crate::utils::sanitize::sanitize_file_name;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use uuid::Uuid;

#[async_trait]
pub trait FileDestination: Send + Sync {
    /// May suspend while the user picks a location.
    async fn open(&self, metadata: &FileMetadata) -> Result<Box<dyn FileSink>, PersistenceError>;
}

#[async_trait]
pub trait FileSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), PersistenceError>;

    async fn finalize(self: Box<Self>) -> Result<(), PersistenceError>;

    async fn abort(self: Box<Self>);
}

/// Writes every received file into one directory.
#[derive(Debug, Clone)]
pub struct DirectoryDestination {
    dir: PathBuf,
}

impl DirectoryDestination {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl FileDestination for DirectoryDestination {
    async fn open(&self, metadata: &FileMetadata) -> Result<Box<dyn FileSink>, PersistenceError> {
        fs::create_dir_all(&self.dir).await?;
        let name = sanitize_file_name(&metadata.name);
        let part_path = self
            .dir
            .join(format!("{name}.{}{PART_FILE_SUFFIX}", Uuid::new_v4().simple()));
        let size = metadata.size;
        let mut part = PartFile {
            file: None,
            part_path,
            dir: self.dir.clone(),
            name,
            finished: false,
        };

        // Runs detached: if this call is cancelled mid-create, the task still
        // completes and dropping its output removes the part file.
        let created = tokio::spawn(async move {
            part.file = Some(fs::File::create(&part.part_path).await?);
            debug!(event = "part_file_created", path = %part.part_path.display(), size);
            Ok::<_, PersistenceError>(part)
        })
        .await
        .map_err(|e| PersistenceError::Unavailable(e.to_string()))??;

        Ok(Box::new(created))
    }
}

struct PartFile {
    file: Option<fs::File>,
    part_path: PathBuf,
    dir: PathBuf,
    name: String,
    finished: bool,
}

#[async_trait]
impl FileSink for PartFile {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), PersistenceError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| PersistenceError::Unavailable("sink already closed".into()))?;
        file.write_all(chunk).await?;
        Ok(())
    }

    async fn finalize(mut self: Box<Self>) -> Result<(), PersistenceError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let final_path = unique_path(&self.dir, &self.name).await;
        fs::rename(&self.part_path, &final_path).await.map_err(|e| {
            error!(
                event = "part_rename_failure",
                from = %self.part_path.display(),
                to = %final_path.display(),
                error = %e,
            );
            e
        })?;
        self.finished = true;
        info!(event = "file_saved", path = %final_path.display());
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        drop(self.file.take());
        let _ = fs::remove_file(&self.part_path).await;
        self.finished = true;
        debug!(event = "part_file_removed", path = %self.part_path.display());
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.finished {
            drop(self.file.take());
            let _ = std::fs::remove_file(&self.part_path);
        }
    }
}

/// `dir/name`, or `dir/stem (n).ext` for the first free `n`.
async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let mut n = 1u32;
    loop {
        let file_name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(file_name);
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}
