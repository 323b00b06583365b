//! File reading service
//!
//! The `loadfile` command goes through this trait so controllers never
//! touch the filesystem directly.

use async_trait::async_trait;
use cncbridge_core::{CommandError, Result};

/// File access interface for `loadfile`
#[async_trait]
pub trait FileService: Send + Sync {
    /// Read a file into a string
    async fn read_to_string(&self, path: &str) -> Result<String>;
}

/// Local filesystem implementation
#[derive(Default)]
pub struct LocalFileService;

impl LocalFileService {
    /// Create a new local file service
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileService for LocalFileService {
    async fn read_to_string(&self, path: &str) -> Result<String> {
        tokio::fs::read_to_string(path).await.map_err(|e| {
            CommandError::FileRead {
                path: path.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// No-op implementation for embedders without file access
#[derive(Default)]
pub struct NoOpFileService;

impl NoOpFileService {
    /// Create a new no-op file service
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileService for NoOpFileService {
    async fn read_to_string(&self, path: &str) -> Result<String> {
        Err(CommandError::FileRead {
            path: path.to_string(),
            reason: "file access is not available".to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_local_file_service_reads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "G0 X0").unwrap();

        let service = LocalFileService::new();
        let content = service
            .read_to_string(file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(content, "G0 X0\n");
    }

    #[tokio::test]
    async fn test_local_file_service_missing_file() {
        let service = LocalFileService::new();
        let err = service.read_to_string("/no/such/file.nc").await.unwrap_err();
        assert!(err.is_command_error());
    }

    #[tokio::test]
    async fn test_noop_file_service_rejects() {
        let service = NoOpFileService::new();
        assert!(service.read_to_string("anything").await.is_err());
    }
}
