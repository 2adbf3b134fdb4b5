//! 本地目录 Blob 存储
//!
//! `store(bytes, "scene_1.png", Some("p1"))` 写入 `{root}/p1/scene_1.png`，
//! 返回公开引用 `{public_prefix}/p1/scene_1.png`（默认前缀 `/static/media`）。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::store::{BlobStore, StoreError};

const SHARED_DIR: &str = "_shared";

/// 本地文件系统 Blob 存储
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_prefix: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_prefix: &str) -> Self {
        Self {
            root: root.into(),
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 公开引用 -> 本地路径；拒绝越出 root 的引用
    fn resolve(&self, reference: &str) -> Result<PathBuf, StoreError> {
        let relative = reference
            .strip_prefix(&self.public_prefix)
            .unwrap_or(reference)
            .trim_start_matches('/');
        let relative = Path::new(relative);
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::Unavailable(format!(
                "invalid blob reference: {reference}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(
        &self,
        bytes: &[u8],
        logical_name: &str,
        project_id: Option<&str>,
    ) -> Result<String, StoreError> {
        let reference = format!(
            "{}/{}/{}",
            self.public_prefix,
            project_id.unwrap_or(SHARED_DIR),
            logical_name.trim_start_matches('/')
        );
        let path = self.resolve(&reference)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "blob stored");
        Ok(reference)
    }

    async fn load(&self, reference: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(reference)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn remove(&self, reference: &str) -> Result<(), StoreError> {
        let path = self.resolve(reference)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_returns_public_reference() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStore::new(dir.path(), "/static/media/");
        let reference = blobs.store(b"png", "scene_1.png", Some("p1")).await.unwrap();
        assert_eq!(reference, "/static/media/p1/scene_1.png");
        assert!(dir.path().join("p1/scene_1.png").exists());
        assert_eq!(blobs.load(&reference).await.unwrap(), b"png");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStore::new(dir.path(), "/static/media");
        let reference = blobs.store(b"x", "drafts/a.png", Some("p1")).await.unwrap();
        blobs.remove(&reference).await.unwrap();
        blobs.remove(&reference).await.unwrap();
        assert!(blobs.load(&reference).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStore::new(dir.path(), "/static/media");
        assert!(blobs.store(b"x", "../escape.png", Some("p1")).await.is_err());
        assert!(blobs.load("/static/media/../../etc/passwd").await.is_err());
    }
}
