//! Remote sync backend contract and an in-process implementation.
//!
//! The real cloud transport is supplied by the host application; it only
//! has to implement `RemoteBackend`. `MemoryRemote` keeps everything in
//! memory and is shared by every store that syncs against it, which makes
//! it the backend for tests and for running without a cloud account.

use crate::models::{
    change::EntityKind,
    sync_record::{ChangeToken, PullBatch, PushAck, SyncRecord},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NetworkError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote rejected request: {0}")]
    Rejected(String),
}

impl NetworkError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, NetworkError::Rejected(_))
    }
}

/// Push/pull of whole-record snapshots keyed by id.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Upload local changes. The ack lists the ids the remote recorded.
    async fn push_changes(&self, records: Vec<SyncRecord>) -> Result<PushAck, NetworkError>;

    /// Fetch everything changed after `since` (everything when `None`).
    async fn pull_changes(&self, since: Option<ChangeToken>) -> Result<PullBatch, NetworkError>;
}

#[derive(Default)]
struct RemoteState {
    /// Latest record per id with the change sequence that produced it.
    records: HashMap<Uuid, (u64, SyncRecord)>,
    last_seq: u64,
}

impl RemoteState {
    fn bump(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    fn is_tombstoned(&self, id: Uuid) -> bool {
        matches!(self.records.get(&id), Some((_, SyncRecord::Tombstone(_))))
    }

    fn apply(&mut self, record: SyncRecord) {
        let id = record.id();
        if self.is_tombstoned(id) {
            return;
        }
        let merged = match (self.records.remove(&id), record) {
            (_, SyncRecord::Tombstone(tombstone)) => {
                if tombstone.entity == EntityKind::Folder {
                    self.tombstone_children(tombstone.id, tombstone.deleted_at);
                }
                SyncRecord::Tombstone(tombstone)
            }
            (Some((_, SyncRecord::Folder(mut current))), SyncRecord::Folder(incoming)) => {
                if incoming.name_updated_at > current.name_updated_at {
                    current.name = incoming.name;
                    current.name_updated_at = incoming.name_updated_at;
                }
                SyncRecord::Folder(current)
            }
            (Some((_, SyncRecord::Item(mut current))), SyncRecord::Item(incoming)) => {
                if incoming.key_updated_at > current.key_updated_at {
                    current.key = incoming.key;
                    current.key_updated_at = incoming.key_updated_at;
                }
                if incoming.text_updated_at > current.text_updated_at {
                    current.text_value = incoming.text_value;
                    current.text_updated_at = incoming.text_updated_at;
                }
                SyncRecord::Item(current)
            }
            (_, SyncRecord::Item(incoming)) if self.is_tombstoned(incoming.folder_id) => return,
            (_, incoming) => incoming,
        };
        let seq = self.bump();
        self.records.insert(id, (seq, merged));
    }

    fn tombstone_children(&mut self, folder_id: Uuid, deleted_at: chrono::DateTime<chrono::Utc>) {
        let children: Vec<Uuid> = self
            .records
            .values()
            .filter_map(|(_, record)| match record {
                SyncRecord::Item(item) if item.folder_id == folder_id => Some(item.id),
                _ => None,
            })
            .collect();
        for id in children {
            let seq = self.bump();
            self.records.insert(
                id,
                (
                    seq,
                    SyncRecord::Tombstone(crate::models::sync_record::TombstoneRecord {
                        id,
                        entity: EntityKind::Item,
                        deleted_at,
                    }),
                ),
            );
        }
    }
}

/// In-memory remote with monotonic change tokens and field-level
/// last-writer-wins. Clones share state.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
    online: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    pushes: Arc<AtomicU64>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState::default())),
            online: Arc::new(AtomicBool::new(true)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            pushes: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful pushes so far.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Current record for `id`, if the remote has seen it.
    pub async fn record(&self, id: Uuid) -> Option<SyncRecord> {
        let state = self.state.lock().await;
        state.records.get(&id).map(|(_, record)| record.clone())
    }

    async fn simulate_network(&self) -> Result<(), NetworkError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(NetworkError::Unreachable("memory remote is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn push_changes(&self, records: Vec<SyncRecord>) -> Result<PushAck, NetworkError> {
        self.simulate_network().await?;
        let mut state = self.state.lock().await;
        let mut ack = PushAck::default();
        for record in records {
            ack.accepted.push(record.id());
            state.apply(record);
        }
        self.pushes.fetch_add(1, Ordering::SeqCst);
        debug!(records = ack.accepted.len(), seq = state.last_seq, "memory remote accepted push");
        Ok(ack)
    }

    async fn pull_changes(&self, since: Option<ChangeToken>) -> Result<PullBatch, NetworkError> {
        self.simulate_network().await?;
        let state = self.state.lock().await;
        let after = since.map(|token| token.0).unwrap_or(0);
        let mut changed: Vec<&(u64, SyncRecord)> = state
            .records
            .values()
            .filter(|(seq, _)| *seq > after)
            .collect();
        changed.sort_by_key(|(seq, _)| *seq);
        Ok(PullBatch {
            records: changed.into_iter().map(|(_, r)| r.clone()).collect(),
            new_token: ChangeToken(state.last_seq.max(after)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        item::ItemKind,
        sync_record::{FolderRecord, ItemRecord, TombstoneRecord},
    };
    use chrono::{Duration as ChronoDuration, Utc};

    fn folder(id: Uuid, name: &str, at: chrono::DateTime<Utc>) -> SyncRecord {
        SyncRecord::Folder(FolderRecord {
            id,
            name: name.into(),
            created_at: at,
            name_updated_at: at,
        })
    }

    fn text_item(id: Uuid, folder_id: Uuid, key: &str, at: chrono::DateTime<Utc>) -> SyncRecord {
        SyncRecord::Item(ItemRecord {
            id,
            folder_id,
            key: key.into(),
            kind: ItemKind::Text,
            text_value: Some("body".into()),
            file_name: None,
            file_bytes: None,
            created_at: at,
            key_updated_at: at,
            text_updated_at: at,
        })
    }

    #[tokio::test]
    async fn pull_returns_changes_after_token() {
        let remote = MemoryRemote::new();
        let now = Utc::now();
        let a = Uuid::new_v4();
        remote.push_changes(vec![folder(a, "A", now)]).await.unwrap();
        let first = remote.pull_changes(None).await.unwrap();
        assert_eq!(first.records.len(), 1);

        let b = Uuid::new_v4();
        remote.push_changes(vec![folder(b, "B", now)]).await.unwrap();
        let second = remote.pull_changes(Some(first.new_token)).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].id(), b);
        assert!(second.new_token > first.new_token);

        let empty = remote.pull_changes(Some(second.new_token)).await.unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.new_token, second.new_token);
    }

    #[tokio::test]
    async fn older_field_values_do_not_win() {
        let remote = MemoryRemote::new();
        let now = Utc::now();
        let id = Uuid::new_v4();
        remote.push_changes(vec![folder(id, "New", now)]).await.unwrap();
        remote
            .push_changes(vec![folder(id, "Old", now - ChronoDuration::seconds(5))])
            .await
            .unwrap();
        match remote.record(id).await.unwrap() {
            SyncRecord::Folder(f) => assert_eq!(f.name, "New"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn folder_tombstone_cascades_and_sticks() {
        let remote = MemoryRemote::new();
        let now = Utc::now();
        let folder_id = Uuid::new_v4();
        let item_id = Uuid::new_v4();
        remote
            .push_changes(vec![folder(folder_id, "F", now), text_item(item_id, folder_id, "k", now)])
            .await
            .unwrap();
        remote
            .push_changes(vec![SyncRecord::Tombstone(TombstoneRecord {
                id: folder_id,
                entity: EntityKind::Folder,
                deleted_at: now,
            })])
            .await
            .unwrap();
        assert!(matches!(
            remote.record(item_id).await,
            Some(SyncRecord::Tombstone(_))
        ));

        // a stale device re-pushing the folder cannot resurrect it
        remote.push_changes(vec![folder(folder_id, "F", now)]).await.unwrap();
        assert!(matches!(
            remote.record(folder_id).await,
            Some(SyncRecord::Tombstone(_))
        ));
    }

    #[tokio::test]
    async fn offline_calls_fail_transiently() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let err = remote.pull_changes(None).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(remote.push_count(), 0);
    }
}
