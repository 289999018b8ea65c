use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::services::{ArtifactStore, ServiceError};

/// Artifact store backed by a local (or mounted) directory.
pub struct DirArtifactStore {
    root: PathBuf,
}

impl DirArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto a path under the root. Keys may not climb out of it.
    fn path_for(&self, key: &str) -> Result<PathBuf, ServiceError> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(ServiceError::Other(format!("unusable artifact key {:?}", key)));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStore for DirArtifactStore {
    async fn put(
        &self,
        key: &str,
        _content_type: &str,
        body: Vec<u8>,
    ) -> Result<String, ServiceError> {
        let path = self.path_for(key)?;
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(ServiceError::Other(format!("unusable artifact key {:?}", key)));
        };
        tokio::fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!(".{}.tmp", name.to_string_lossy()));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "Artifact written");
        Ok(path.to_string_lossy().into_owned())
    }
}
