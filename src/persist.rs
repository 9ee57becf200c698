//! Where reply payloads end up.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, RpcError};

/// Destination for reply payloads.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Store `payload` under `file_name`. Returns where it was written, if
    /// anywhere.
    async fn write(&self, payload: &[u8], file_name: &str) -> Result<Option<PathBuf>>;
}

/// A fresh, practically unique file name for one document.
pub fn unique_file_name() -> String {
    format!("pdf_{}.pdf", Uuid::new_v4())
}

/// Writes every payload to its own file inside a directory.
#[derive(Debug, Clone)]
pub struct DiskSink {
    directory: PathBuf,
}

impl DiskSink {
    /// Create the output directory (and parents) and return a sink over it.
    pub async fn create(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await.map_err(|err| {
            RpcError::Persistence(format!(
                "failed to create output directory {}: {}",
                directory.display(),
                err
            ))
        })?;
        info!("Writing documents to {}", directory.display());
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[async_trait]
impl PersistenceSink for DiskSink {
    async fn write(&self, payload: &[u8], file_name: &str) -> Result<Option<PathBuf>> {
        let path = self.directory.join(file_name);
        tokio::fs::write(&path, payload).await.map_err(|err| {
            RpcError::Persistence(format!("failed to write {}: {}", path.display(), err))
        })?;
        debug!("Saved {} bytes to {}", payload.len(), path.display());
        Ok(Some(path))
    }
}

/// Drops every payload. Used when writing to disk is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

#[async_trait]
impl PersistenceSink for DiscardSink {
    async fn write(&self, _payload: &[u8], _file_name: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}
