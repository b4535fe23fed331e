//! Project repository.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::params;
use scheduler0_commons::constants::PROJECTS_TABLE;
use scheduler0_commons::models::Project;
use scheduler0_commons::{Clock, SchedulerError};
use scheduler0_raft::{RaftActions, SqlValue};
use scheduler0_store::SqliteStore;

use super::{placeholders, project_columns, project_from_row};

#[derive(Clone)]
pub struct ProjectRepo {
    store: Arc<SqliteStore>,
    actions: Arc<RaftActions>,
    clock: Arc<dyn Clock>,
}

impl ProjectRepo {
    pub fn new(store: Arc<SqliteStore>, actions: Arc<RaftActions>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            actions,
            clock,
        }
    }

    /// Create a project. Rejects empty fields and duplicate names.
    pub async fn create_one(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Project, SchedulerError> {
        if name.is_empty() {
            return Err(SchedulerError::validation("name field is required"));
        }
        if description.is_empty() {
            return Err(SchedulerError::validation("description field is required"));
        }
        if let Some(existing) = self.get_one_by_name(name)? {
            return Err(SchedulerError::validation(format!(
                "another project exists with the same name, project with id {} has the same name",
                existing.id
            )));
        }

        let now = self.clock.now();
        let response = self
            .actions
            .write_db_command(
                format!(
                    "INSERT INTO {PROJECTS_TABLE} (name, description, date_created) \
                     VALUES (?1, ?2, ?3)"
                ),
                vec![
                    SqlValue::from(name),
                    SqlValue::from(description),
                    SqlValue::from(now),
                ],
            )
            .await?;

        self.get_one_by_id(response.last_inserted_id)?
            .ok_or_else(|| SchedulerError::internal("created project not found"))
    }

    pub fn get_one_by_name(&self, name: &str) -> Result<Option<Project>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {} FROM {PROJECTS_TABLE} WHERE name = ?1",
            project_columns()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let mut rows = stmt
            .query_map(params![name], project_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        match rows.next() {
            Some(project) => Ok(Some(
                project.map_err(|e| SchedulerError::internal(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn get_one_by_id(&self, id: u64) -> Result<Option<Project>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {} FROM {PROJECTS_TABLE} WHERE id = ?1",
            project_columns()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let mut rows = stmt
            .query_map(params![id], project_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        match rows.next() {
            Some(project) => Ok(Some(
                project.map_err(|e| SchedulerError::internal(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn list(&self, offset: u64, limit: u64) -> Result<Vec<Project>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {} FROM {PROJECTS_TABLE} ORDER BY id LIMIT ?1 OFFSET ?2",
            project_columns()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit, offset], project_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    pub fn count(&self) -> Result<u64, SchedulerError> {
        let conn = self.store.acquire();
        conn.query_row(&format!("SELECT count(*) FROM {PROJECTS_TABLE}"), [], |r| {
            r.get(0)
        })
        .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Update the description. Name and id are immutable.
    pub async fn update_one_by_id(
        &self,
        id: u64,
        description: &str,
    ) -> Result<Project, SchedulerError> {
        if description.is_empty() {
            return Err(SchedulerError::validation("description field is required"));
        }
        if self.get_one_by_id(id)?.is_none() {
            return Err(SchedulerError::not_found(format!(
                "project with id {id} does not exist"
            )));
        }

        self.actions
            .write_db_command(
                format!("UPDATE {PROJECTS_TABLE} SET description = ?1 WHERE id = ?2"),
                vec![SqlValue::from(description), SqlValue::from(id)],
            )
            .await?;

        self.get_one_by_id(id)?
            .ok_or_else(|| SchedulerError::internal("updated project not found"))
    }

    /// Delete a project. Rejected while jobs still reference it.
    pub async fn delete_one_by_id(&self, id: u64) -> Result<u64, SchedulerError> {
        if self.get_one_by_id(id)?.is_none() {
            return Err(SchedulerError::not_found(format!(
                "project with id {id} does not exist"
            )));
        }

        let job_count: u64 = {
            let conn = self.store.acquire();
            conn.query_row(
                "SELECT count(*) FROM jobs WHERE project_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .map_err(|e| SchedulerError::internal(e.to_string()))?
        };
        if job_count > 0 {
            return Err(SchedulerError::validation("cannot delete project with jobs"));
        }

        let response = self
            .actions
            .write_db_command(
                format!("DELETE FROM {PROJECTS_TABLE} WHERE id = ?1"),
                vec![SqlValue::from(id)],
            )
            .await?;
        Ok(response.rows_affected)
    }

    pub fn get_batch_projects_by_ids(
        &self,
        project_ids: &[u64],
    ) -> Result<Vec<Project>, SchedulerError> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }
        let unique: BTreeSet<u64> = project_ids.iter().copied().collect();
        let ids: Vec<u64> = unique.into_iter().collect();

        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {} FROM {PROJECTS_TABLE} WHERE id IN ({})",
            project_columns(),
            placeholders(1, ids.len())
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(ids.iter().map(|id| *id as i64)),
                project_from_row,
            )
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }
}
