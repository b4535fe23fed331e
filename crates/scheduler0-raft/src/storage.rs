//! Combined Raft storage.
//!
//! Implements the combined `RaftStorage` trait (v1 API) covering log access,
//! state machine application, and snapshot building, wired into openraft via
//! the `Adaptor`. The raft log lives in memory; durability of the domain
//! state comes from the SQLite database and its snapshots.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftStorage, Snapshot};
use openraft::{
    Entry, EntryPayload, LogId, OptionalSend, RaftSnapshotBuilder, SnapshotMeta, StorageError,
    StorageIOError, StoredMembership, Vote,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::command::{encode as codec_encode, Command, CommandResponse};
use crate::fsm::SchedulerFsm;
use crate::types::{Node, NodeId, TypeConfig};

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta<NodeId, Node>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntryData {
    log_id: LogId<NodeId>,
    payload: Vec<u8>,
}

/// Snapshot payload: apply metadata plus the framed SQLite database.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StateMachineData {
    last_applied_log: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, Node>,
    db: Vec<u8>,
}

pub struct SchedulerRaftStorage {
    log: RwLock<BTreeMap<u64, LogEntryData>>,
    vote: RwLock<Option<Vote<NodeId>>>,
    committed: RwLock<Option<LogId<NodeId>>>,
    last_purged: RwLock<Option<LogId<NodeId>>>,
    fsm: Arc<SchedulerFsm>,
    last_applied: RwLock<Option<LogId<NodeId>>>,
    last_membership: RwLock<StoredMembership<NodeId, Node>>,
    snapshot_idx: AtomicU64,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
}

impl Debug for SchedulerRaftStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRaftStorage")
            .field("snapshot_idx", &self.snapshot_idx)
            .finish_non_exhaustive()
    }
}

impl SchedulerRaftStorage {
    pub fn new(fsm: Arc<SchedulerFsm>) -> Self {
        Self {
            log: RwLock::new(BTreeMap::new()),
            vote: RwLock::new(None),
            committed: RwLock::new(None),
            last_purged: RwLock::new(None),
            fsm,
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(None),
        }
    }

    pub fn fsm(&self) -> &Arc<SchedulerFsm> {
        &self.fsm
    }

    fn get_log_entries_sync(&self, range: impl RangeBounds<u64>) -> Vec<Entry<TypeConfig>> {
        let log = self.log.read();
        log.range(range)
            .map(|(_, entry)| {
                match crate::command::decode::<EntryPayload<TypeConfig>>(&entry.payload) {
                    Ok(payload) => Entry {
                        log_id: entry.log_id,
                        payload,
                    },
                    Err(e) => {
                        log::warn!("failed to decode raft log entry: {e}");
                        Entry {
                            log_id: entry.log_id,
                            payload: EntryPayload::Blank,
                        }
                    }
                }
            })
            .collect()
    }
}

pub struct SchedulerLogReader {
    storage: Arc<SchedulerRaftStorage>,
}

impl Clone for SchedulerLogReader {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl RaftLogReader<TypeConfig> for SchedulerLogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.storage.get_log_entries_sync(range))
    }
}

pub struct SchedulerSnapshotBuilder {
    storage: Arc<SchedulerRaftStorage>,
}

impl RaftSnapshotBuilder<TypeConfig> for SchedulerSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let last_applied = *self.storage.last_applied.read();
        let last_membership = self.storage.last_membership.read().clone();

        let db = self
            .storage
            .fsm
            .snapshot()
            .map_err(|e| StorageIOError::read_state_machine(&std::io::Error::other(e.to_string())))?;

        let data = StateMachineData {
            last_applied_log: last_applied,
            last_membership: last_membership.clone(),
            db,
        };
        let serialized = codec_encode(&data)
            .map_err(|e| StorageIOError::read_state_machine(&std::io::Error::other(e.to_string())))?;

        let snapshot_idx = self.storage.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_applied {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{}", snapshot_idx)
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id,
        };

        {
            let mut current = self.storage.current_snapshot.write();
            *current = Some(StoredSnapshot {
                meta: meta.clone(),
                data: serialized.clone(),
            });
        }

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(serialized)),
        })
    }
}

impl RaftLogReader<TypeConfig> for Arc<SchedulerRaftStorage> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.get_log_entries_sync(range))
    }
}

#[allow(deprecated)] // RaftStorage v1: the v2 split traits are sealed in this openraft line
impl RaftStorage<TypeConfig> for Arc<SchedulerRaftStorage> {
    type LogReader = SchedulerLogReader;
    type SnapshotBuilder = SchedulerSnapshotBuilder;

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut current = self.vote.write();
        *current = Some(vote.clone());
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote.read().clone())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        let mut c = self.committed.write();
        *c = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed.read().clone())
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let log = self.log.read();
        let last_purged = self.last_purged.read().clone();
        let last_log_id = log.iter().next_back().map(|(_, e)| e.log_id);

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        SchedulerLogReader {
            storage: self.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut log = self.log.write();
        for entry in entries {
            let payload = codec_encode(&entry.payload)
                .map_err(|e| StorageIOError::write_logs(&std::io::Error::other(e.to_string())))?;
            log.insert(
                entry.log_id.index,
                LogEntryData {
                    log_id: entry.log_id,
                    payload,
                },
            );
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        let mut log = self.log.write();
        let keys: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut log = self.log.write();
        let mut last_purged = self.last_purged.write();
        let keys: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        *last_purged = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Node>), StorageError<NodeId>> {
        Ok((*self.last_applied.read(), self.last_membership.read().clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<Vec<u8>>, StorageError<NodeId>> {
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            let log_id = entry.log_id;
            {
                let mut last = self.last_applied.write();
                *last = Some(log_id);
            }

            match &entry.payload {
                EntryPayload::Blank => results.push(Vec::new()),
                EntryPayload::Normal(data) => {
                    let response = match crate::command::decode::<Command>(data) {
                        Ok(command) => self.fsm.apply(&command),
                        Err(e) => {
                            log::error!(
                                "undecodable command at raft index {}: {e}",
                                log_id.index
                            );
                            CommandResponse::default()
                        }
                    };
                    let bytes = codec_encode(&response).map_err(|e| {
                        StorageIOError::write_state_machine(&std::io::Error::other(e.to_string()))
                    })?;
                    results.push(bytes);
                }
                EntryPayload::Membership(membership) => {
                    let mut current = self.last_membership.write();
                    *current = StoredMembership::new(Some(log_id), membership.clone());
                    results.push(Vec::new());
                }
            }
        }

        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SchedulerSnapshotBuilder {
            storage: self.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Node>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();

        let sm_data: StateMachineData = crate::command::decode(&data).map_err(|e| {
            StorageIOError::read_snapshot(
                Some(meta.signature()),
                &std::io::Error::other(e.to_string()),
            )
        })?;

        self.fsm.restore(&sm_data.db).map_err(|e| {
            StorageIOError::read_snapshot(
                Some(meta.signature()),
                &std::io::Error::other(e.to_string()),
            )
        })?;

        {
            let mut last = self.last_applied.write();
            *last = meta.last_log_id;
        }
        {
            let mut membership = self.last_membership.write();
            *membership = meta.last_membership.clone();
        }
        {
            let mut current = self.current_snapshot.write();
            *current = Some(StoredSnapshot {
                meta: meta.clone(),
                data,
            });
        }

        if let Some(last_log_id) = meta.last_log_id {
            let mut log = self.log.write();
            let mut last_purged = self.last_purged.write();
            let keys: Vec<u64> = log.range(..=last_log_id.index).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
            *last_purged = Some(last_log_id);
        }

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let current = self.current_snapshot.read();
        Ok(current.as_ref().map(|snapshot| Snapshot {
            meta: snapshot.meta.clone(),
            snapshot: Box::new(Cursor::new(snapshot.data.clone())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SqlValue;
    use scheduler0_store::SqliteStore;

    fn storage() -> Arc<SchedulerRaftStorage> {
        let fsm = Arc::new(SchedulerFsm::new(Arc::new(SqliteStore::in_memory().unwrap())));
        Arc::new(SchedulerRaftStorage::new(fsm))
    }

    #[tokio::test]
    async fn vote_operations() {
        let mut storage = storage();
        assert!(storage.read_vote().await.unwrap().is_none());

        let vote = Vote::new(1, 1);
        storage.save_vote(&vote).await.unwrap();
        assert_eq!(storage.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn log_append_and_state() {
        let mut storage = storage();
        let state = storage.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());

        let entry = Entry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(1, 1), 1),
            payload: EntryPayload::Blank,
        };
        storage.append_to_log(vec![entry]).await.unwrap();

        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 1);
    }

    #[tokio::test]
    async fn apply_normal_entry_mutates_the_store() {
        let mut storage = storage();
        let command = Command::DbExecute {
            sql: "INSERT INTO projects (name, description, date_created) VALUES (?1, ?2, ?3)"
                .into(),
            params: vec![
                SqlValue::from("p"),
                SqlValue::from("d"),
                SqlValue::from("2024-01-01T00:00:00+00:00"),
            ],
        };
        let entry = Entry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(1, 1), 1),
            payload: EntryPayload::Normal(codec_encode(&command).unwrap()),
        };

        let results = storage.apply_to_state_machine(&[entry]).await.unwrap();
        let response: CommandResponse = crate::command::decode(&results[0]).unwrap();
        assert_eq!(response.last_inserted_id, 1);

        let (last_applied, _) = storage.last_applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 1);
    }

    #[tokio::test]
    async fn snapshot_build_and_install_round_trip() {
        let mut source = storage();
        let command = Command::DbExecute {
            sql: "INSERT INTO projects (name, description, date_created) VALUES ('a', 'b', 'c')"
                .into(),
            params: vec![],
        };
        let entry = Entry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(1, 1), 1),
            payload: EntryPayload::Normal(codec_encode(&command).unwrap()),
        };
        source.apply_to_state_machine(&[entry]).await.unwrap();

        let mut builder = source.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.unwrap();

        let mut target = storage();
        let data = snapshot.snapshot.into_inner();
        target
            .install_snapshot(&snapshot.meta, Box::new(Cursor::new(data)))
            .await
            .unwrap();

        let conn = target.fsm().store().acquire();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM projects", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        drop(conn);

        let (last_applied, _) = target.last_applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 1);
    }
}
