//! Credential repository.
//!
//! Key/secret pairs are generated server-side. Secrets only surface to the
//! auth path; handlers strip them from listings.

use std::sync::Arc;

use rusqlite::params;
use scheduler0_commons::constants::CREDENTIALS_TABLE;
use scheduler0_commons::models::Credential;
use scheduler0_commons::{Clock, SchedulerError};
use scheduler0_raft::{RaftActions, SqlValue};
use scheduler0_store::SqliteStore;
use sha2::{Digest, Sha256};

use super::{credential_columns, credential_from_row};

fn random_sha256() -> String {
    let mut hasher = Sha256::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Clone)]
pub struct CredentialRepo {
    store: Arc<SqliteStore>,
    actions: Arc<RaftActions>,
    clock: Arc<dyn Clock>,
}

impl CredentialRepo {
    pub fn new(store: Arc<SqliteStore>, actions: Arc<RaftActions>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            actions,
            clock,
        }
    }

    /// Create a credential with freshly generated key material.
    pub async fn create_one(&self) -> Result<Credential, SchedulerError> {
        let api_key = random_sha256();
        let api_secret = random_sha256();
        let now = self.clock.now();

        let response = self
            .actions
            .write_db_command(
                format!(
                    "INSERT INTO {CREDENTIALS_TABLE} \
                     (api_key, api_secret, archived, date_created) VALUES (?1, ?2, 0, ?3)"
                ),
                vec![
                    SqlValue::from(api_key),
                    SqlValue::from(api_secret),
                    SqlValue::from(now),
                ],
            )
            .await?;

        self.get_one_by_id(response.last_inserted_id)?
            .ok_or_else(|| SchedulerError::internal("created credential not found"))
    }

    pub fn get_one_by_id(&self, id: u64) -> Result<Option<Credential>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {} FROM {CREDENTIALS_TABLE} WHERE id = ?1",
            credential_columns()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let mut rows = stmt
            .query_map(params![id], credential_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        match rows.next() {
            Some(credential) => Ok(Some(
                credential.map_err(|e| SchedulerError::internal(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn list(&self, offset: u64, limit: u64) -> Result<Vec<Credential>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {} FROM {CREDENTIALS_TABLE} ORDER BY id LIMIT ?1 OFFSET ?2",
            credential_columns()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit, offset], credential_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    pub fn count(&self) -> Result<u64, SchedulerError> {
        let conn = self.store.acquire();
        conn.query_row(
            &format!("SELECT count(*) FROM {CREDENTIALS_TABLE}"),
            [],
            |r| r.get(0),
        )
        .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Only the archived flag is mutable.
    pub async fn update_one_by_id(
        &self,
        id: u64,
        archived: bool,
    ) -> Result<Credential, SchedulerError> {
        if self.get_one_by_id(id)?.is_none() {
            return Err(SchedulerError::not_found(format!(
                "credential with id {id} does not exist"
            )));
        }

        self.actions
            .write_db_command(
                format!("UPDATE {CREDENTIALS_TABLE} SET archived = ?1 WHERE id = ?2"),
                vec![
                    SqlValue::Integer(archived as i64),
                    SqlValue::from(id),
                ],
            )
            .await?;

        self.get_one_by_id(id)?
            .ok_or_else(|| SchedulerError::internal("updated credential not found"))
    }

    /// Delete a credential. The last unarchived credential cannot be removed
    /// or the API would lock everyone out.
    pub async fn delete_one_by_id(&self, id: u64) -> Result<u64, SchedulerError> {
        let credential = self.get_one_by_id(id)?.ok_or_else(|| {
            SchedulerError::not_found(format!("credential with id {id} does not exist"))
        })?;

        if !credential.archived {
            let active: u64 = {
                let conn = self.store.acquire();
                conn.query_row(
                    &format!("SELECT count(*) FROM {CREDENTIALS_TABLE} WHERE archived = 0"),
                    [],
                    |r| r.get(0),
                )
                .map_err(|e| SchedulerError::internal(e.to_string()))?
            };
            if active <= 1 {
                return Err(SchedulerError::validation(
                    "cannot delete the only active credential",
                ));
            }
        }

        let response = self
            .actions
            .write_db_command(
                format!("DELETE FROM {CREDENTIALS_TABLE} WHERE id = ?1"),
                vec![SqlValue::from(id)],
            )
            .await?;
        Ok(response.rows_affected)
    }

    /// Auth lookup: an unarchived credential matching both halves.
    pub fn find_by_key_and_secret(
        &self,
        api_key: &str,
        api_secret: &str,
    ) -> Result<Option<Credential>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {} FROM {CREDENTIALS_TABLE} \
             WHERE api_key = ?1 AND api_secret = ?2 AND archived = 0",
            credential_columns()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let mut rows = stmt
            .query_map(params![api_key, api_secret], credential_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        match rows.next() {
            Some(credential) => Ok(Some(
                credential.map_err(|e| SchedulerError::internal(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }
}
