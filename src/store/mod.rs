//! 存储层：WorkUnit 记录存储与媒体 Blob 存储
//!
//! - `WorkRecordStore`：按 (project_id, id) 寻址的文档存储，逐调用原子字段补丁；
//! - `BlobStore`：字节 -> 公开 URL 引用；
//! 后端：JSON 文件 / 内存（file）、SQLite（sqlite）、本地目录（blob）。

pub mod blob;
pub mod file;
pub mod record;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StoreSection;

pub use blob::LocalBlobStore;
pub use file::FileRecordStore;
pub use record::{next_unit_id, MotionComposition, NewWorkUnit, WorkUnit, WorkUnitPatch};
pub use sqlite::SqliteRecordStore;

/// 存储错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("work unit not found: {project_id}/{id}")]
    NotFound { project_id: String, id: String },

    #[error("record serialization failed: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// WorkUnit 文档存储
#[async_trait]
pub trait WorkRecordStore: Send + Sync {
    /// 新建 WorkUnit（status = draft），返回 ID
    async fn create_unit(&self, project_id: &str, fields: NewWorkUnit) -> Result<String, StoreError>;

    /// 原子地应用字段补丁，返回更新后的记录
    async fn update_unit(
        &self,
        project_id: &str,
        id: &str,
        patch: WorkUnitPatch,
    ) -> Result<WorkUnit, StoreError>;

    async fn get_unit(&self, project_id: &str, id: &str) -> Result<Option<WorkUnit>, StoreError>;

    /// 项目下全部 WorkUnit，按 created_at（再按 id）升序
    async fn list_units(&self, project_id: &str) -> Result<Vec<WorkUnit>, StoreError>;

    async fn list_projects(&self) -> Result<Vec<String>, StoreError>;
}

/// 媒体 Blob 存储
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 写入字节，返回可公开访问的引用
    async fn store(
        &self,
        bytes: &[u8],
        logical_name: &str,
        project_id: Option<&str>,
    ) -> Result<String, StoreError>;

    async fn load(&self, reference: &str) -> Result<Vec<u8>, StoreError>;

    /// 删除引用对应的对象；不存在时视为成功
    async fn remove(&self, reference: &str) -> Result<(), StoreError>;
}

/// 按 [store] 配置打开记录存储
pub async fn open_record_store(
    section: &StoreSection,
    data_dir: &Path,
) -> Result<Arc<dyn WorkRecordStore>, StoreError> {
    let path = section
        .path
        .clone()
        .unwrap_or_else(|| data_dir.join(section.default_file_name()));
    match section.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteRecordStore::open(&path).await?)),
        "memory" => Ok(Arc::new(FileRecordStore::in_memory())),
        "file" => Ok(Arc::new(FileRecordStore::open(&path).await?)),
        other => Err(StoreError::Unavailable(format!(
            "unknown store backend: {other}"
        ))),
    }
}

/// 项目内最新（created_at 最大）的 WorkUnit
pub fn latest_unit(units: &[WorkUnit]) -> Option<&WorkUnit> {
    units
        .iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
}

pub(crate) fn sort_units(units: &mut [WorkUnit]) {
    units.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
