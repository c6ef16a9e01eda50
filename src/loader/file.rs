//! Loader for images stored on the local filesystem.
//!
//! Identities look like `file:/data/series/slice-0001.raw`. The payload is
//! the raw file contents; decoding is left to whatever registered the
//! loader under a scheme of its own.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::LoadError;
use crate::identity::ImageId;

use super::{LoadedImage, Loader};

/// Reads the file named by the identity's locator.
#[derive(Debug, Clone, Default)]
pub struct FileLoader {
    root: Option<PathBuf>,
}

impl FileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative locators against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn path_for(&self, id: &ImageId) -> PathBuf {
        let locator = Path::new(id.locator());
        match &self.root {
            Some(root) if locator.is_relative() => root.join(locator),
            _ => locator.to_path_buf(),
        }
    }
}

#[async_trait]
impl Loader for FileLoader {
    async fn load(&self, id: &ImageId) -> Result<LoadedImage, LoadError> {
        let path = self.path_for(id);
        let data = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => LoadError::not_found(path.display().to_string()),
            ErrorKind::InvalidData => LoadError::format(format!("{}: {}", path.display(), e)),
            ErrorKind::TimedOut => LoadError::timeout(format!("{}: {}", path.display(), e)),
            _ => LoadError::network(format!("{}: {}", path.display(), e)),
        })?;

        Ok(LoadedImage::from_bytes(Bytes::from(data)))
    }
}
