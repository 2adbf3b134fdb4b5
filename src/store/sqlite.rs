//! SQLite 记录存储
//!
//! 每个 WorkUnit 以 JSON 文档形式存一行；补丁在事务内「读文档 -> apply -> 写回」。
//! rusqlite 是同步 API，所有操作放进 spawn_blocking，连接由 std Mutex 独占。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{
    next_unit_id, NewWorkUnit, StoreError, WorkRecordStore, WorkUnit, WorkUnitPatch,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS work_units (
    project_id TEXT NOT NULL,
    id         TEXT NOT NULL,
    created_at TEXT NOT NULL,
    document   TEXT NOT NULL,
    PRIMARY KEY (project_id, id)
);
CREATE INDEX IF NOT EXISTS idx_work_units_created ON work_units (project_id, created_at);
";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// SQLite 文档存储
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

fn decode(document: &str) -> Result<WorkUnit, StoreError> {
    Ok(serde_json::from_str(document)?)
}

#[async_trait]
impl WorkRecordStore for SqliteRecordStore {
    async fn create_unit(&self, project_id: &str, fields: NewWorkUnit) -> Result<String, StoreError> {
        let unit = WorkUnit::new(project_id, next_unit_id(), fields);
        let id = unit.id.clone();
        let document = serde_json::to_string(&unit)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO work_units (project_id, id, created_at, document) VALUES (?1, ?2, ?3, ?4)",
                params![unit.project_id, unit.id, unit.created_at.to_rfc3339(), document],
            )?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn update_unit(
        &self,
        project_id: &str,
        id: &str,
        patch: WorkUnitPatch,
    ) -> Result<WorkUnit, StoreError> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let document: Option<String> = tx
                .query_row(
                    "SELECT document FROM work_units WHERE project_id = ?1 AND id = ?2",
                    params![project_id, id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(document) = document else {
                return Err(StoreError::NotFound { project_id, id });
            };
            let mut unit = decode(&document)?;
            unit.apply(patch);
            tx.execute(
                "UPDATE work_units SET document = ?3 WHERE project_id = ?1 AND id = ?2",
                params![project_id, id, serde_json::to_string(&unit)?],
            )?;
            tx.commit()?;
            Ok(unit)
        })
        .await
    }

    async fn get_unit(&self, project_id: &str, id: &str) -> Result<Option<WorkUnit>, StoreError> {
        let project_id = project_id.to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            let document: Option<String> = conn
                .query_row(
                    "SELECT document FROM work_units WHERE project_id = ?1 AND id = ?2",
                    params![project_id, id],
                    |row| row.get(0),
                )
                .optional()?;
            document.as_deref().map(decode).transpose()
        })
        .await
    }

    async fn list_units(&self, project_id: &str) -> Result<Vec<WorkUnit>, StoreError> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT document FROM work_units WHERE project_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(params![project_id], |row| row.get::<_, String>(0))?;
            let mut units = Vec::new();
            for row in rows {
                units.push(decode(&row?)?);
            }
            Ok(units)
        })
        .await
    }

    async fn list_projects(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT project_id FROM work_units ORDER BY project_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut projects = Vec::new();
            for row in rows {
                projects.push(row?);
            }
            Ok(projects)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SceneStatus, StageState};

    fn fields() -> NewWorkUnit {
        NewWorkUnit {
            sequence_number: 1,
            script: "s".into(),
            visual_prompt: "v".into(),
            ..NewWorkUnit::default()
        }
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_patch() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let id = store.create_unit("p1", fields()).await.unwrap();

        let updated = store
            .update_unit(
                "p1",
                &id,
                WorkUnitPatch::new()
                    .status(SceneStatus::GeneratingImage)
                    .stage(StageState::Illustrating),
            )
            .await
            .unwrap();
        assert_eq!(updated.stage, StageState::Illustrating);

        let fetched = store.get_unit("p1", &id).await.unwrap().unwrap();
        assert_eq!(fetched, updated);
        assert_eq!(store.list_units("p1").await.unwrap().len(), 1);
        assert_eq!(store.list_projects().await.unwrap(), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn test_sqlite_missing_unit() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        assert!(store.get_unit("p1", "nope").await.unwrap().is_none());
        let err = store
            .update_unit("p1", "nope", WorkUnitPatch::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("units.db");
        let id = {
            let store = SqliteRecordStore::open(&path).await.unwrap();
            store.create_unit("p1", fields()).await.unwrap()
        };
        let store = SqliteRecordStore::open(&path).await.unwrap();
        assert!(store.get_unit("p1", &id).await.unwrap().is_some());
    }
}
