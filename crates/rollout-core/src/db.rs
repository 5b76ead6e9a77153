//! Persistent storage for release executions using redb.
//!
//! A single `EXECUTIONS` table keyed by the 16 raw bytes of the execution id.
//! Values are JSON-encoded [`ReleaseExecution`] records, stage executions
//! included, so every save replaces the whole record in one transaction.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{Result, RolloutError};
use crate::execution::ReleaseExecution;

/// Persistence for execution records. Implementations must make `save`
/// atomic per record.
pub trait ExecutionStore: Send + Sync {
    /// Store a new record. Fails if the id is already present.
    fn insert(&self, execution: &ReleaseExecution) -> Result<()>;
    /// Replace an existing record.
    fn save(&self, execution: &ReleaseExecution) -> Result<()>;
    fn get(&self, id: Uuid) -> Result<ReleaseExecution>;
    /// Newest first.
    fn list_for_release(&self, release_id: u64) -> Result<Vec<ReleaseExecution>>;
    fn count_for_release(&self, release_id: u64) -> Result<u64>;
    /// Newest first.
    fn list_all(&self) -> Result<Vec<ReleaseExecution>>;
}

// ---------------------------------------------------------------------------
// Table definition
// ---------------------------------------------------------------------------

/// Key: execution uuid bytes. Value: JSON-encoded ReleaseExecution.
const EXECUTIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("executions");

fn db_err(e: impl std::fmt::Display) -> RolloutError {
    RolloutError::ExecutionDb(e.to_string())
}

// ---------------------------------------------------------------------------
// ExecutionDb
// ---------------------------------------------------------------------------

pub struct ExecutionDb {
    db: Database,
}

impl ExecutionDb {
    /// Open or create the database at `path`, creating the table if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(EXECUTIONS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    fn write(&self, execution: &ReleaseExecution, must_exist: bool) -> Result<()> {
        let value = serde_json::to_vec(execution).map_err(db_err)?;
        let key = execution.id.as_bytes();
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(EXECUTIONS).map_err(db_err)?;
            let exists = table.get(key.as_slice()).map_err(db_err)?.is_some();
            if must_exist && !exists {
                return Err(RolloutError::ExecutionNotFound(execution.id));
            }
            if !must_exist && exists {
                return Err(RolloutError::ExecutionDb(format!(
                    "release execution {} already exists",
                    execution.id
                )));
            }
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn scan(&self, mut keep: impl FnMut(&ReleaseExecution) -> bool) -> Result<Vec<ReleaseExecution>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(EXECUTIONS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let execution: ReleaseExecution = serde_json::from_slice(v.value()).map_err(db_err)?;
            if keep(&execution) {
                result.push(execution);
            }
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }
}

impl ExecutionStore for ExecutionDb {
    fn insert(&self, execution: &ReleaseExecution) -> Result<()> {
        self.write(execution, false)
    }

    fn save(&self, execution: &ReleaseExecution) -> Result<()> {
        self.write(execution, true)
    }

    fn get(&self, id: Uuid) -> Result<ReleaseExecution> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(EXECUTIONS).map_err(db_err)?;
        let guard = table
            .get(id.as_bytes().as_slice())
            .map_err(db_err)?
            .ok_or(RolloutError::ExecutionNotFound(id))?;
        let execution = serde_json::from_slice(guard.value()).map_err(db_err)?;
        Ok(execution)
    }

    fn list_for_release(&self, release_id: u64) -> Result<Vec<ReleaseExecution>> {
        self.scan(|e| e.release_id == release_id)
    }

    fn count_for_release(&self, release_id: u64) -> Result<u64> {
        Ok(self.list_for_release(release_id)?.len() as u64)
    }

    fn list_all(&self) -> Result<Vec<ReleaseExecution>> {
        self.scan(|_| true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::DeployRequest;
    use crate::planner;
    use crate::release::{Release, ReleaseStage, ReleaseTargets};
    use crate::types::{ReleaseStatus, StageStatus};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, ExecutionDb) {
        let dir = TempDir::new().unwrap();
        let db = ExecutionDb::open(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn execution(release_id: u64, sequence: u64) -> ReleaseExecution {
        let release = Release {
            id: release_id,
            name: "web".into(),
            version: "1.0".into(),
            customer_id: 1,
            status: ReleaseStatus::Active,
            description: None,
            targets: ReleaseTargets::Stages(vec![ReleaseStage {
                id: 1,
                environment_id: 1,
                order_index: Some(0),
                pre_deployment_approval: false,
                post_deployment_approval: false,
                auto_deploy: true,
                agent_id: None,
            }]),
        };
        let plan = planner::plan(&release).unwrap();
        ReleaseExecution::from_plan(
            &release,
            &plan,
            DeployRequest::new(1, release_id),
            sequence,
            &HashMap::new(),
        )
    }

    #[test]
    fn insert_then_get() {
        let (_dir, db) = open_tmp();
        let exec = execution(1, 1);
        db.insert(&exec).unwrap();
        assert_eq!(db.get(exec.id).unwrap(), exec);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (_dir, db) = open_tmp();
        let exec = execution(1, 1);
        db.insert(&exec).unwrap();
        assert!(matches!(db.insert(&exec), Err(RolloutError::ExecutionDb(_))));
    }

    #[test]
    fn save_replaces_record() {
        let (_dir, db) = open_tmp();
        let mut exec = execution(1, 1);
        db.insert(&exec).unwrap();
        exec.stages[0].status = StageStatus::Succeeded;
        db.save(&exec).unwrap();
        assert_eq!(db.get(exec.id).unwrap().stages[0].status, StageStatus::Succeeded);
    }

    #[test]
    fn save_unknown_record_is_not_found() {
        let (_dir, db) = open_tmp();
        let exec = execution(1, 1);
        assert!(matches!(
            db.save(&exec),
            Err(RolloutError::ExecutionNotFound(id)) if id == exec.id
        ));
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, db) = open_tmp();
        assert!(matches!(
            db.get(Uuid::new_v4()),
            Err(RolloutError::ExecutionNotFound(_))
        ));
    }

    #[test]
    fn list_and_count_are_per_release() {
        let (_dir, db) = open_tmp();
        db.insert(&execution(1, 1)).unwrap();
        db.insert(&execution(1, 2)).unwrap();
        db.insert(&execution(2, 1)).unwrap();

        assert_eq!(db.count_for_release(1).unwrap(), 2);
        assert_eq!(db.count_for_release(3).unwrap(), 0);
        assert_eq!(db.list_all().unwrap().len(), 3);

        let listed = db.list_for_release(1).unwrap();
        assert!(listed.iter().all(|e| e.release_id == 1));
        assert!(listed[0].created_at >= listed[1].created_at);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("executions.db");
        let exec = execution(1, 1);
        {
            let db = ExecutionDb::open(&path).unwrap();
            db.insert(&exec).unwrap();
        }
        let db = ExecutionDb::open(&path).unwrap();
        assert_eq!(db.get(exec.id).unwrap(), exec);
    }
}
