//! The replicated state machine.
//!
//! Interprets committed [`Command`] entries against the SQLite store. Apply
//! is deterministic and never blocks on the network; business-rule errors do
//! not exist here: validation runs before a command is submitted, so a
//! failure on this path is a storage defect and is logged as such.

use std::sync::Arc;

use rusqlite::{params, params_from_iter, Connection};
use scheduler0_commons::models::{AsyncTask, AsyncTaskState, JobExecutionLog, LocalData, NodeRange};
use scheduler0_commons::constants::{ASYNC_TASKS_COMMITTED_TABLE, JOB_QUEUES_TABLE, JOB_QUEUE_VERSIONS_TABLE};
use scheduler0_store::{SharedRepo, SqliteStore};
use tokio::sync::broadcast;

use crate::command::{AsyncTaskCommand, Command, CommandResponse};
use crate::error::RaftError;

/// Emitted after a command is applied so the scheduling components can react
/// without polling.
#[derive(Debug, Clone)]
pub enum FsmEvent {
    /// A new allocation epoch was committed.
    JobQueueUpdated { version: u64, ranges: Vec<NodeRange> },
    /// New async tasks exist in the committed bucket.
    AsyncTasksCreated { task_ids: Vec<u64> },
    /// Async tasks transitioned; `state` may be terminal.
    AsyncTasksTransitioned {
        task_ids: Vec<u64>,
        state: AsyncTaskState,
    },
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct SchedulerFsm {
    store: Arc<SqliteStore>,
    events: broadcast::Sender<FsmEvent>,
}

impl SchedulerFsm {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FsmEvent> {
        self.events.subscribe()
    }

    /// Apply one committed command. Infallible by contract: storage failures
    /// are logged and produce an empty response rather than poisoning the
    /// apply loop.
    pub fn apply(&self, command: &Command) -> CommandResponse {
        match self.try_apply(command) {
            Ok(response) => response,
            Err(err) => {
                log::error!("state machine apply failed: {err}");
                CommandResponse::default()
            }
        }
    }

    fn try_apply(&self, command: &Command) -> Result<CommandResponse, RaftError> {
        let conn = self.store.acquire();
        match command {
            Command::DbExecute { sql, params } => {
                let rows_affected = conn
                    .execute(sql, params_from_iter(params.iter()))
                    .map_err(|e| RaftError::Storage(e.to_string()))?;
                Ok(CommandResponse {
                    last_inserted_id: conn.last_insert_rowid() as u64,
                    rows_affected: rows_affected as u64,
                    task_ids: Vec::new(),
                })
            }
            Command::JobQueue {
                number_of_active_nodes,
                ranges,
                date_created,
            } => {
                let version = self
                    .apply_job_queue(&conn, *number_of_active_nodes, ranges, date_created)
                    .map_err(|e| RaftError::Storage(e.to_string()))?;
                let _ = self.events.send(FsmEvent::JobQueueUpdated {
                    version,
                    ranges: ranges.clone(),
                });
                Ok(CommandResponse {
                    last_inserted_id: version,
                    rows_affected: ranges.len() as u64,
                    task_ids: Vec::new(),
                })
            }
            Command::AsyncTask(task_command) => self.apply_async_task(&conn, task_command),
            Command::ExecutionLogs { logs } => {
                let inserted = SharedRepo::insert_execution_logs_with(&conn, true, logs)?;
                Ok(CommandResponse {
                    last_inserted_id: conn.last_insert_rowid() as u64,
                    rows_affected: inserted,
                    task_ids: Vec::new(),
                })
            }
            Command::LocalData { data } => {
                let logs = SharedRepo::insert_execution_logs_with(&conn, true, &data.execution_logs)?;
                let tasks = SharedRepo::insert_async_tasks_with(&conn, true, &data.async_tasks)?;
                Ok(CommandResponse {
                    last_inserted_id: 0,
                    rows_affected: logs + tasks,
                    task_ids: Vec::new(),
                })
            }
        }
    }

    fn apply_job_queue(
        &self,
        conn: &Connection,
        number_of_active_nodes: u64,
        ranges: &[NodeRange],
        date_created: &chrono::DateTime<chrono::Utc>,
    ) -> rusqlite::Result<u64> {
        conn.execute(
            &format!(
                "INSERT INTO {JOB_QUEUE_VERSIONS_TABLE} (number_of_active_nodes, date_created) \
                 VALUES (?1, ?2)"
            ),
            params![number_of_active_nodes, date_created.to_rfc3339()],
        )?;
        let version = conn.last_insert_rowid() as u64;

        let mut stmt = conn.prepare(&format!(
            "INSERT INTO {JOB_QUEUES_TABLE} \
             (node_id, lower_bound_job_id, upper_bound_job_id, version, date_created) \
             VALUES (?1, ?2, ?3, ?4, ?5)"
        ))?;
        for range in ranges {
            stmt.execute(params![
                range.node_id,
                range.lower_bound_job_id,
                range.upper_bound_job_id,
                version,
                date_created.to_rfc3339(),
            ])?;
        }
        Ok(version)
    }

    fn apply_async_task(
        &self,
        conn: &Connection,
        command: &AsyncTaskCommand,
    ) -> Result<CommandResponse, RaftError> {
        match command {
            AsyncTaskCommand::Create { tasks } => {
                let inserted = SharedRepo::insert_async_tasks_with(conn, true, tasks)?;
                let task_ids = resolve_task_ids(conn, tasks)
                    .map_err(|e| RaftError::Storage(e.to_string()))?;
                let _ = self.events.send(FsmEvent::AsyncTasksCreated {
                    task_ids: task_ids.clone(),
                });
                Ok(CommandResponse {
                    last_inserted_id: task_ids.last().copied().unwrap_or(0),
                    rows_affected: inserted,
                    task_ids,
                })
            }
            AsyncTaskCommand::UpdateState {
                task_ids,
                state,
                output,
                expected_state,
            } => {
                if task_ids.is_empty() {
                    return Ok(CommandResponse::default());
                }
                let placeholders = placeholders(task_ids.len());
                let sql = match expected_state {
                    Some(_) => format!(
                        "UPDATE {ASYNC_TASKS_COMMITTED_TABLE} \
                         SET state = ?1, output = COALESCE(?2, output) \
                         WHERE id IN ({placeholders}) AND state = ?{last}",
                        last = task_ids.len() + 3
                    ),
                    None => format!(
                        "UPDATE {ASYNC_TASKS_COMMITTED_TABLE} \
                         SET state = ?1, output = COALESCE(?2, output) \
                         WHERE id IN ({placeholders})"
                    ),
                };
                let mut values: Vec<rusqlite::types::Value> = vec![
                    rusqlite::types::Value::Text(state.as_str().to_string()),
                    match output {
                        Some(o) => rusqlite::types::Value::Text(o.clone()),
                        None => rusqlite::types::Value::Null,
                    },
                ];
                values.extend(
                    task_ids
                        .iter()
                        .map(|id| rusqlite::types::Value::Integer(*id as i64)),
                );
                if let Some(expected) = expected_state {
                    values.push(rusqlite::types::Value::Text(expected.as_str().to_string()));
                }
                let rows_affected = conn
                    .execute(&sql, params_from_iter(values.iter()))
                    .map_err(|e| RaftError::Storage(e.to_string()))?;
                let _ = self.events.send(FsmEvent::AsyncTasksTransitioned {
                    task_ids: task_ids.clone(),
                    state: *state,
                });
                Ok(CommandResponse {
                    last_inserted_id: 0,
                    rows_affected: rows_affected as u64,
                    task_ids: Vec::new(),
                })
            }
        }
    }

    /// Serialize the whole store for a Raft snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>, RaftError> {
        Ok(self.store.serialize_snapshot()?)
    }

    /// Rebuild the store from snapshot bytes.
    pub fn restore(&self, data: &[u8]) -> Result<(), RaftError> {
        self.store.restore_snapshot(data)?;
        Ok(())
    }
}

impl std::fmt::Debug for SchedulerFsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerFsm").finish_non_exhaustive()
    }
}

/// Resolve committed task ids for a batch, including rows that already
/// existed before this apply (the idempotent-create case).
fn resolve_task_ids(conn: &Connection, tasks: &[AsyncTask]) -> rusqlite::Result<Vec<u64>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {ASYNC_TASKS_COMMITTED_TABLE} WHERE request_id = ?1 AND service = ?2"
    ))?;
    let mut ids = Vec::with_capacity(tasks.len());
    for task in tasks {
        let id: u64 = stmt.query_row(params![task.request_id, task.service], |row| row.get(0))?;
        ids.push(id);
    }
    Ok(ids)
}

/// Placeholder offsets start at ?3 (after state and output).
fn placeholders(count: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", i + 3))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SqlValue;
    use chrono::{TimeZone, Utc};
    use scheduler0_commons::models::ExecutionState;

    fn fsm() -> SchedulerFsm {
        SchedulerFsm::new(Arc::new(SqliteStore::in_memory().unwrap()))
    }

    fn at() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap()
    }

    #[test]
    fn db_execute_reports_inserted_id_and_rows() {
        let fsm = fsm();
        let response = fsm.apply(&Command::DbExecute {
            sql: "INSERT INTO projects (name, description, date_created) VALUES (?1, ?2, ?3)"
                .into(),
            params: vec![
                SqlValue::from("p"),
                SqlValue::from("d"),
                SqlValue::from(at()),
            ],
        });
        assert_eq!(response.last_inserted_id, 1);
        assert_eq!(response.rows_affected, 1);
    }

    #[test]
    fn job_queue_apply_bumps_version_and_records_ranges() {
        let fsm = fsm();
        let mut events = fsm.subscribe();
        let ranges = vec![
            NodeRange {
                node_id: 1,
                lower_bound_job_id: 1,
                upper_bound_job_id: 5,
            },
            NodeRange {
                node_id: 2,
                lower_bound_job_id: 6,
                upper_bound_job_id: 10,
            },
        ];

        let first = fsm.apply(&Command::JobQueue {
            number_of_active_nodes: 2,
            ranges: ranges.clone(),
            date_created: at(),
        });
        let second = fsm.apply(&Command::JobQueue {
            number_of_active_nodes: 2,
            ranges: ranges.clone(),
            date_created: at(),
        });
        assert_eq!(first.last_inserted_id, 1);
        assert_eq!(second.last_inserted_id, 2);

        match events.try_recv().unwrap() {
            FsmEvent::JobQueueUpdated { version, ranges } => {
                assert_eq!(version, 1);
                assert_eq!(ranges.len(), 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let conn = fsm.store().acquire();
        let rows: i64 = conn
            .query_row("SELECT count(*) FROM job_queues WHERE version = 2", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(rows, 2);
    }

    fn task(request_id: &str) -> AsyncTask {
        AsyncTask {
            id: 0,
            request_id: request_id.into(),
            service: "batch_insert_jobs".into(),
            input: "{}".into(),
            output: String::new(),
            state: AsyncTaskState::NotStarted,
            date_created: at(),
        }
    }

    #[test]
    fn async_task_create_is_idempotent_and_returns_same_ids() {
        let fsm = fsm();
        let first = fsm.apply(&Command::AsyncTask(AsyncTaskCommand::Create {
            tasks: vec![task("r1")],
        }));
        let second = fsm.apply(&Command::AsyncTask(AsyncTaskCommand::Create {
            tasks: vec![task("r1")],
        }));
        assert_eq!(first.task_ids, second.task_ids);
        assert_eq!(first.rows_affected, 1);
        assert_eq!(second.rows_affected, 0);
    }

    #[test]
    fn async_task_claim_is_compare_and_set() {
        let fsm = fsm();
        let created = fsm.apply(&Command::AsyncTask(AsyncTaskCommand::Create {
            tasks: vec![task("r1")],
        }));
        let id = created.task_ids[0];

        let claim = |fsm: &SchedulerFsm| {
            fsm.apply(&Command::AsyncTask(AsyncTaskCommand::UpdateState {
                task_ids: vec![id],
                state: AsyncTaskState::InProgress,
                output: None,
                expected_state: Some(AsyncTaskState::NotStarted),
            }))
        };

        assert_eq!(claim(&fsm).rows_affected, 1);
        // Second claim loses: the row is no longer `not_started`.
        assert_eq!(claim(&fsm).rows_affected, 0);
    }

    #[test]
    fn execution_logs_commit_is_idempotent() {
        let fsm = fsm();
        let log = JobExecutionLog {
            id: 0,
            unique_id: JobExecutionLog::compute_unique_id(1, at(), 2, 1),
            state: ExecutionState::Success,
            node_id: 2,
            last_execution_datetime: at(),
            next_execution_datetime: at(),
            job_id: 1,
            execution_version: 1,
            job_queue_version: 1,
            date_created: at(),
        };

        let first = fsm.apply(&Command::ExecutionLogs {
            logs: vec![log.clone()],
        });
        let second = fsm.apply(&Command::ExecutionLogs { logs: vec![log] });
        assert_eq!(first.rows_affected, 1);
        assert_eq!(second.rows_affected, 0);
    }

    #[test]
    fn local_data_applies_both_tables() {
        let fsm = fsm();
        let data = LocalData {
            execution_logs: vec![JobExecutionLog {
                id: 0,
                unique_id: JobExecutionLog::compute_unique_id(9, at(), 3, 1),
                state: ExecutionState::Failed,
                node_id: 3,
                last_execution_datetime: at(),
                next_execution_datetime: at(),
                job_id: 9,
                execution_version: 1,
                job_queue_version: 2,
                date_created: at(),
            }],
            async_tasks: vec![task("peer-r1")],
        };
        let response = fsm.apply(&Command::LocalData { data });
        assert_eq!(response.rows_affected, 2);
    }

    #[test]
    fn snapshot_restore_round_trips_state() {
        let fsm = fsm();
        fsm.apply(&Command::DbExecute {
            sql: "INSERT INTO projects (name, description, date_created) VALUES ('a', 'b', 'c')"
                .into(),
            params: vec![],
        });
        let bytes = fsm.snapshot().unwrap();

        let other = SchedulerFsm::new(Arc::new(SqliteStore::in_memory().unwrap()));
        other.restore(&bytes).unwrap();
        let conn = other.store().acquire();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM projects", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
