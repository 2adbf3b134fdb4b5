//! JSON 文件记录存储（也可纯内存运行）
//!
//! 整个数据库是一个 JSON 文档：`{ projects: { <project_id>: { units: { <id>: WorkUnit } } } }`。
//! 每次写操作在内部锁内完成「读改写 + 落盘」，落盘先写临时文件再 rename，中途崩溃不会留下半截文件。
//! 落盘失败时内存中的改动会回滚，读到的始终是最后一次成功落盘的状态。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::store::{
    next_unit_id, sort_units, NewWorkUnit, StoreError, WorkRecordStore, WorkUnit, WorkUnitPatch,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Database {
    #[serde(default)]
    projects: BTreeMap<String, ProjectRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectRecord {
    #[serde(default)]
    units: BTreeMap<String, WorkUnit>,
}

/// 文件 / 内存记录存储
#[derive(Debug)]
pub struct FileRecordStore {
    /// None 表示纯内存
    path: Option<PathBuf>,
    db: Mutex<Database>,
}

impl FileRecordStore {
    /// 打开（或新建）JSON 文件存储；文件损坏时报 Serialization，不静默覆盖
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db = match tokio::fs::read_to_string(&path).await {
            Ok(data) if data.trim().is_empty() => Database::default(),
            Ok(data) => serde_json::from_str(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Database::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), "record store opened");
        Ok(Self {
            path: Some(path),
            db: Mutex::new(db),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            db: Mutex::new(Database::default()),
        }
    }

    async fn persist(&self, db: &Database) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(db)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkRecordStore for FileRecordStore {
    async fn create_unit(&self, project_id: &str, fields: NewWorkUnit) -> Result<String, StoreError> {
        let mut db = self.db.lock().await;
        let id = next_unit_id();
        let unit = WorkUnit::new(project_id, id.clone(), fields);
        let new_project = !db.projects.contains_key(project_id);
        db.projects
            .entry(project_id.to_string())
            .or_default()
            .units
            .insert(id.clone(), unit);
        if let Err(e) = self.persist(&db).await {
            if new_project {
                db.projects.remove(project_id);
            } else if let Some(project) = db.projects.get_mut(project_id) {
                project.units.remove(&id);
            }
            return Err(e);
        }
        Ok(id)
    }

    async fn update_unit(
        &self,
        project_id: &str,
        id: &str,
        patch: WorkUnitPatch,
    ) -> Result<WorkUnit, StoreError> {
        let mut db = self.db.lock().await;
        let unit = db
            .projects
            .get_mut(project_id)
            .and_then(|p| p.units.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                project_id: project_id.to_string(),
                id: id.to_string(),
            })?;
        let previous = unit.clone();
        unit.apply(patch);
        let updated = unit.clone();
        if let Err(e) = self.persist(&db).await {
            if let Some(unit) = db.projects.get_mut(project_id).and_then(|p| p.units.get_mut(id)) {
                *unit = previous;
            }
            return Err(e);
        }
        Ok(updated)
    }

    async fn get_unit(&self, project_id: &str, id: &str) -> Result<Option<WorkUnit>, StoreError> {
        let db = self.db.lock().await;
        Ok(db
            .projects
            .get(project_id)
            .and_then(|p| p.units.get(id))
            .cloned())
    }

    async fn list_units(&self, project_id: &str) -> Result<Vec<WorkUnit>, StoreError> {
        let db = self.db.lock().await;
        let mut units: Vec<WorkUnit> = db
            .projects
            .get(project_id)
            .map(|p| p.units.values().cloned().collect())
            .unwrap_or_default();
        sort_units(&mut units);
        Ok(units)
    }

    async fn list_projects(&self) -> Result<Vec<String>, StoreError> {
        let db = self.db.lock().await;
        Ok(db.projects.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SceneStatus;

    fn fields(seq: u32) -> NewWorkUnit {
        NewWorkUnit {
            sequence_number: seq,
            script: format!("script {seq}"),
            visual_prompt: "neon".into(),
            ..NewWorkUnit::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_update() {
        let store = FileRecordStore::in_memory();
        let id = store.create_unit("p1", fields(1)).await.unwrap();
        let unit = store.get_unit("p1", &id).await.unwrap().unwrap();
        assert_eq!(unit.status, SceneStatus::Draft);

        let updated = store
            .update_unit("p1", &id, WorkUnitPatch::new().status(SceneStatus::GeneratingImage))
            .await
            .unwrap();
        assert_eq!(updated.status, SceneStatus::GeneratingImage);
        assert_eq!(updated.script, "script 1");
    }

    #[tokio::test]
    async fn test_update_missing_unit() {
        let store = FileRecordStore::in_memory();
        let err = store
            .update_unit("p1", "scene_0", WorkUnitPatch::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let id = {
            let store = FileRecordStore::open(&path).await.unwrap();
            store.create_unit("p1", fields(1)).await.unwrap()
        };
        let store = FileRecordStore::open(&path).await.unwrap();
        assert!(store.get_unit("p1", &id).await.unwrap().is_some());
        assert_eq!(store.list_projects().await.unwrap(), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let store = FileRecordStore::open(&path).await.unwrap();
        let id = store.create_unit("p1", fields(1)).await.unwrap();

        // 临时文件路径被目录占住，写入必然失败
        std::fs::create_dir(dir.path().join("db.json.tmp")).unwrap();
        let err = store
            .update_unit("p1", &id, WorkUnitPatch::new().status(SceneStatus::GeneratingImage))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        let unit = store.get_unit("p1", &id).await.unwrap().unwrap();
        assert_eq!(unit.status, SceneStatus::Draft);

        assert!(store.create_unit("p1", fields(2)).await.is_err());
        assert!(store.create_unit("p2", fields(1)).await.is_err());
        assert_eq!(store.list_units("p1").await.unwrap().len(), 1);
        assert_eq!(store.list_projects().await.unwrap(), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = FileRecordStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_list_units_in_creation_order() {
        let store = FileRecordStore::in_memory();
        let a = store.create_unit("p1", fields(1)).await.unwrap();
        let b = store.create_unit("p1", fields(2)).await.unwrap();
        let ids: Vec<String> = store
            .list_units("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec![a, b]);
        assert!(store.list_units("other").await.unwrap().is_empty());
    }
}
