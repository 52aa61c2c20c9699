//! src/services/store_service.rs
//!
//! JarStore: folders and items backed by SQLite for records and the
//! BlobStore for payloads above the inline threshold.
//!
//! Every mutation is one SQLite transaction taken under a store-wide writer
//! lock, so writes to the same record apply in arrival order and the last
//! commit wins. Subscribers are notified after the commit. Reads never take
//! the writer lock.

use crate::{
    db,
    models::{
        change::{ChangeAction, ChangeEvent, EntityKind},
        folder::{DEFAULT_FOLDER_NAME, Folder},
        item::{Item, ItemKind, ItemPayload, ItemUpdate, NewItem},
        sync_record::{
            ChangeToken, FolderRecord, ItemRecord, PullBatch, PushAck, SyncRecord,
            TombstoneRecord,
        },
    },
    services::{
        blob_store::{BlobStore, StoredBlob, checksum_of},
        change_hub::{ChangeHub, Subscription},
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, SqliteConnection, SqlitePool, sqlite::Sqlite};
use std::{
    collections::{HashMap, HashSet},
    io::{self, ErrorKind},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("folder `{0}` not found")]
    FolderNotFound(Uuid),
    #[error("item `{0}` not found")]
    ItemNotFound(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// True for local I/O or database failures.
    pub fn is_storage(&self) -> bool {
        matches!(self, StoreError::Sqlx(_) | StoreError::Io(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Payloads larger than this many bytes are stored out of line by default.
pub const DEFAULT_INLINE_THRESHOLD: usize = 64 * 1024;

const FOLDER_COLUMNS: &str = "id, name, created_at, name_updated_at";
const ITEM_COLUMNS: &str = "id, folder_id, key, kind, text_value, file_name, inline_bytes, \
     blob_path, size_bytes, checksum, created_at, key_updated_at, text_updated_at";
const TOKEN_STATE_KEY: &str = "change_token";

/// Where and how to open a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub database_url: String,
    pub blob_dir: PathBuf,
    pub inline_threshold: usize,
    pub max_connections: u32,
}

#[derive(FromRow)]
struct DirtyFolder {
    #[sqlx(flatten)]
    folder: Folder,
    local_version: i64,
}

#[derive(FromRow)]
struct DirtyItem {
    #[sqlx(flatten)]
    item: Item,
    local_version: i64,
}

/// Local changes not yet acknowledged by the remote, captured in one read.
#[derive(Debug, Clone, Default)]
pub struct PendingChanges {
    pub records: Vec<SyncRecord>,
    versions: HashMap<Uuid, i64>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Payload after it has been placed inline or on disk.
enum StoredPayload {
    None,
    Inline { bytes: Bytes, checksum: String },
    External(StoredBlob),
}

impl StoredPayload {
    fn inline_bytes(&self) -> Option<&[u8]> {
        match self {
            StoredPayload::Inline { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    fn blob_path(&self) -> Option<&str> {
        match self {
            StoredPayload::External(blob) => Some(&blob.relative_path),
            _ => None,
        }
    }

    fn size_bytes(&self) -> i64 {
        match self {
            StoredPayload::None => 0,
            StoredPayload::Inline { bytes, .. } => bytes.len() as i64,
            StoredPayload::External(blob) => blob.size_bytes,
        }
    }

    fn checksum(&self) -> Option<&str> {
        match self {
            StoredPayload::None => None,
            StoredPayload::Inline { checksum, .. } => Some(checksum),
            StoredPayload::External(blob) => Some(&blob.checksum),
        }
    }
}

/// Column values for a new item row.
struct ItemRow<'a> {
    id: Uuid,
    folder_id: Uuid,
    key: &'a str,
    kind: ItemKind,
    text_value: Option<&'a str>,
    file_name: Option<&'a str>,
    payload: &'a StoredPayload,
    created_at: DateTime<Utc>,
    key_updated_at: DateTime<Utc>,
    text_updated_at: DateTime<Utc>,
    dirty: bool,
}

/// What a merged pull changed.
#[derive(Default)]
struct MergeOutcome {
    events: Vec<ChangeEvent>,
    removed_blobs: Vec<String>,
}

/// The local store. Cheap to clone; clones share the pool, the writer lock
/// and the subscriber list.
#[derive(Clone)]
pub struct JarStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    blobs: BlobStore,
    hub: ChangeHub,
    write_lock: Arc<Mutex<()>>,
    inline_threshold: usize,
}

impl JarStore {
    pub fn new(db: Arc<SqlitePool>, blobs: BlobStore, inline_threshold: usize) -> Self {
        Self {
            db,
            blobs,
            hub: ChangeHub::new(),
            write_lock: Arc::new(Mutex::new(())),
            inline_threshold,
        }
    }

    /// Connect, apply migrations and prepare the blob directory.
    pub async fn open(options: &StoreOptions) -> StoreResult<Self> {
        let pool = db::connect(&options.database_url, options.max_connections).await?;
        db::run_migrations(&pool).await?;
        let blobs = BlobStore::new(&options.blob_dir);
        blobs.ensure_root().await?;
        let store = Self::new(Arc::new(pool), blobs, options.inline_threshold);
        if let Err(err) = store.sweep_orphan_blobs().await {
            warn!(error = %err, "could not sweep orphaned blobs");
        }
        Ok(store)
    }

    /// Delete blob files that no item row points at. These are left by a
    /// crash between a blob write and its commit, or by a failed removal.
    /// Only safe before the store is shared, because a create writes its
    /// blob before the row exists.
    async fn sweep_orphan_blobs(&self) -> StoreResult<usize> {
        let referenced: HashSet<String> = sqlx::query_scalar::<_, String>(
            "SELECT blob_path FROM items WHERE blob_path IS NOT NULL",
        )
        .fetch_all(&*self.db)
        .await?
        .into_iter()
        .collect();
        let orphans: Vec<String> = self
            .blobs
            .list()
            .await?
            .into_iter()
            .filter(|path| !referenced.contains(path))
            .collect();
        if !orphans.is_empty() {
            info!(count = orphans.len(), "removing orphaned blob files");
            self.blobs.remove_all(&orphans).await;
        }
        Ok(orphans.len())
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Register a callback for committed changes. Drop the returned handle
    /// to unsubscribe.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(callback)
    }

    /// Cheap connectivity check for readiness probes.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    // --- Folders ---

    /// Create a folder. A blank name becomes "Folder".
    pub async fn create_folder(&self, name: &str) -> StoreResult<Folder> {
        let name = if name.trim().is_empty() {
            DEFAULT_FOLDER_NAME
        } else {
            name
        };

        let guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let folder = sqlx::query_as::<_, Folder>(&format!(
            "INSERT INTO folders (id, name, created_at, name_updated_at, dirty, local_version)
             VALUES (?, ?, ?, ?, 1, 1)
             RETURNING {FOLDER_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        drop(guard);

        debug!(folder = %folder.id, "created folder");
        self.hub.publish(&[ChangeEvent::local(
            ChangeAction::Added,
            EntityKind::Folder,
            folder.id,
        )]);
        Ok(folder)
    }

    pub async fn rename_folder(&self, id: Uuid, new_name: &str) -> StoreResult<Folder> {
        ensure_not_blank(new_name, "folder name")?;

        let guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let folder = sqlx::query_as::<_, Folder>(&format!(
            "UPDATE folders
             SET name = ?, name_updated_at = ?, dirty = 1, local_version = local_version + 1
             WHERE id = ?
             RETURNING {FOLDER_COLUMNS}"
        ))
        .bind(new_name)
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::FolderNotFound(id))?;
        tx.commit().await?;
        drop(guard);

        self.hub.publish(&[ChangeEvent::local(
            ChangeAction::Updated,
            EntityKind::Folder,
            id,
        )]);
        Ok(folder)
    }

    /// Delete a folder and every item it owns in one transaction.
    ///
    /// Published rows get tombstones so a stale remote copy cannot bring
    /// them back. Rows the remote never saw leave nothing behind. Blobs are
    /// removed after commit.
    pub async fn delete_folder(&self, id: Uuid) -> StoreResult<()> {
        let guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let (folder_published, removed) = remove_folder_rows(&mut tx, id)
            .await?
            .ok_or(StoreError::FolderNotFound(id))?;
        if folder_published || removed.iter().any(|item| item.published) {
            write_tombstone(&mut tx, EntityKind::Folder, id, now).await?;
        }
        for item in removed.iter().filter(|item| item.published) {
            write_tombstone(&mut tx, EntityKind::Item, item.id, now).await?;
        }
        tx.commit().await?;
        drop(guard);

        debug!(folder = %id, items = removed.len(), "deleted folder");
        let blob_paths: Vec<String> = removed
            .iter()
            .filter_map(|item| item.blob_path.clone())
            .collect();
        self.blobs.remove_all(&blob_paths).await;

        let mut events: Vec<ChangeEvent> = removed
            .iter()
            .map(|item| ChangeEvent::local(ChangeAction::Removed, EntityKind::Item, item.id))
            .collect();
        events.push(ChangeEvent::local(
            ChangeAction::Removed,
            EntityKind::Folder,
            id,
        ));
        self.hub.publish(&events);
        Ok(())
    }

    pub async fn get_folder(&self, id: Uuid) -> StoreResult<Folder> {
        let mut conn = self.db.acquire().await?;
        fetch_folder(&mut conn, id)
            .await?
            .ok_or(StoreError::FolderNotFound(id))
    }

    /// All folders ordered by name.
    pub async fn list_folders(&self) -> StoreResult<Vec<Folder>> {
        let folders = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders ORDER BY name ASC, seq ASC"
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(folders)
    }

    // --- Items ---

    /// Create an item in `folder_id`.
    ///
    /// The key must not be blank; text items need a non-blank body and file
    /// items need non-empty bytes. Captured stills without a file name get a
    /// generated one.
    pub async fn create_item(&self, folder_id: Uuid, new: NewItem) -> StoreResult<Item> {
        validate_payload(
            &new.key,
            new.kind,
            new.text_value.as_deref(),
            new.file_bytes.as_deref(),
        )?;

        let id = Uuid::new_v4();
        let payload = self.store_payload(id, new.file_bytes.clone()).await?;
        let result = self.insert_new_item(id, folder_id, &new, &payload).await;
        let item = match result {
            Ok(item) => item,
            Err(err) => {
                if let Some(path) = payload.blob_path() {
                    let _ = self.blobs.remove(path).await;
                }
                return Err(err);
            }
        };

        debug!(item = %item.id, folder = %folder_id, kind = %item.kind, "created item");
        self.hub.publish(&[ChangeEvent::local(
            ChangeAction::Added,
            EntityKind::Item,
            item.id,
        )]);
        Ok(item)
    }

    async fn insert_new_item(
        &self,
        id: Uuid,
        folder_id: Uuid,
        new: &NewItem,
        payload: &StoredPayload,
    ) -> StoreResult<Item> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let file_name = if new.kind.is_text() {
            None
        } else {
            new.file_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .or_else(|| new.kind.default_file_name(now))
        };

        let mut tx = self.db.begin().await?;
        if !folder_exists(&mut tx, folder_id).await? {
            return Err(StoreError::FolderNotFound(folder_id));
        }
        let item = insert_item_row(
            &mut tx,
            &ItemRow {
                id,
                folder_id,
                key: &new.key,
                kind: new.kind,
                text_value: new.text_value.as_deref(),
                file_name: file_name.as_deref(),
                payload,
                created_at: now,
                key_updated_at: now,
                text_updated_at: now,
                dirty: true,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(item)
    }

    /// Partially update an item. Only fields present in `update` are
    /// validated and written; the rest keep their value and timestamp.
    pub async fn update_item(&self, id: Uuid, update: ItemUpdate) -> StoreResult<Item> {
        if let Some(key) = &update.key {
            ensure_not_blank(key, "key")?;
        }
        if let Some(text) = &update.text_value {
            ensure_not_blank(text, "text value")?;
        }

        let guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        let current = fetch_item(&mut tx, id)
            .await?
            .ok_or(StoreError::ItemNotFound(id))?;
        if update.text_value.is_some() && !current.kind.is_text() {
            return Err(StoreError::Validation(format!(
                "{} items have no text value",
                current.kind
            )));
        }
        if update.key.is_none() && update.text_value.is_none() {
            return Ok(current);
        }

        let now = Utc::now();
        let mut builder = QueryBuilder::<Sqlite>::new(
            "UPDATE items SET dirty = 1, local_version = local_version + 1",
        );
        if let Some(key) = update.key {
            builder.push(", key = ");
            builder.push_bind(key);
            builder.push(", key_updated_at = ");
            builder.push_bind(now);
        }
        if let Some(text) = update.text_value {
            builder.push(", text_value = ");
            builder.push_bind(text);
            builder.push(", text_updated_at = ");
            builder.push_bind(now);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(format!(" RETURNING {ITEM_COLUMNS}"));

        let item: Item = builder.build_query_as().fetch_one(&mut *tx).await?;
        tx.commit().await?;
        drop(guard);

        self.hub.publish(&[ChangeEvent::local(
            ChangeAction::Updated,
            EntityKind::Item,
            id,
        )]);
        Ok(item)
    }

    pub async fn delete_item(&self, id: Uuid) -> StoreResult<()> {
        self.delete_items(&[id]).await
    }

    /// Delete several items atomically. Fails without deleting anything if
    /// any id is unknown.
    pub async fn delete_items(&self, ids: &[Uuid]) -> StoreResult<()> {
        let mut seen = HashSet::new();
        let ids: Vec<Uuid> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let mut blob_paths = Vec::new();
        for id in &ids {
            let (blob_path, published) = remove_item_row(&mut tx, *id)
                .await?
                .ok_or(StoreError::ItemNotFound(*id))?;
            blob_paths.extend(blob_path);
            if published {
                write_tombstone(&mut tx, EntityKind::Item, *id, now).await?;
            }
        }
        tx.commit().await?;
        drop(guard);

        self.blobs.remove_all(&blob_paths).await;
        let events: Vec<ChangeEvent> = ids
            .iter()
            .map(|id| ChangeEvent::local(ChangeAction::Removed, EntityKind::Item, *id))
            .collect();
        self.hub.publish(&events);
        Ok(())
    }

    pub async fn get_item(&self, id: Uuid) -> StoreResult<Item> {
        let mut conn = self.db.acquire().await?;
        fetch_item(&mut conn, id)
            .await?
            .ok_or(StoreError::ItemNotFound(id))
    }

    /// Items of a folder, newest first; equal timestamps keep insertion
    /// order. An unknown folder has no items.
    pub async fn list_items(&self, folder_id: Uuid) -> StoreResult<Vec<Item>> {
        let items = sqlx::query_as::<_, Item>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE folder_id = ?
             ORDER BY created_at DESC, seq ASC"
        ))
        .bind(folder_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(items)
    }

    pub async fn item_count(&self) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM items")
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }

    /// Load an item's content for the clipboard or a preview renderer.
    pub async fn read_payload(&self, id: Uuid) -> StoreResult<ItemPayload> {
        let item = self.get_item(id).await?;
        self.payload_of(&item).await
    }

    async fn payload_of(&self, item: &Item) -> StoreResult<ItemPayload> {
        if item.kind.is_text() {
            return Ok(ItemPayload::Text(
                item.text_value.clone().unwrap_or_default(),
            ));
        }
        let bytes = match (&item.inline_bytes, &item.blob_path) {
            (Some(bytes), _) => Bytes::from(bytes.clone()),
            (None, Some(path)) => self.blobs.read(path).await?,
            (None, None) => Bytes::new(),
        };
        Ok(ItemPayload::File {
            file_name: item.file_name.clone(),
            bytes,
        })
    }

    async fn store_payload(&self, id: Uuid, bytes: Option<Bytes>) -> io::Result<StoredPayload> {
        match bytes {
            None => Ok(StoredPayload::None),
            Some(bytes) if bytes.len() > self.inline_threshold => {
                Ok(StoredPayload::External(self.blobs.write(id, bytes).await?))
            }
            Some(bytes) => {
                let checksum = checksum_of(&bytes);
                Ok(StoredPayload::Inline { bytes, checksum })
            }
        }
    }

    // --- Sync support ---

    /// Snapshot dirty folders and items plus unacknowledged tombstones.
    ///
    /// Every row in the snapshot is flagged as published. A push can reach
    /// the remote even when its acknowledgement is lost, so from here on a
    /// local delete must leave a tombstone.
    pub async fn pending_changes(&self) -> StoreResult<PendingChanges> {
        let guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        let folders = sqlx::query_as::<_, DirtyFolder>(&format!(
            "SELECT {FOLDER_COLUMNS}, local_version FROM folders WHERE dirty = 1 ORDER BY seq"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let items = sqlx::query_as::<_, DirtyItem>(&format!(
            "SELECT {ITEM_COLUMNS}, local_version FROM items WHERE dirty = 1 ORDER BY seq"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let tombstones = sqlx::query_as::<_, TombstoneRecord>(
            "SELECT id, entity, deleted_at FROM tombstones ORDER BY deleted_at",
        )
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("UPDATE folders SET published = 1 WHERE dirty = 1")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE items SET published = 1 WHERE dirty = 1")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        drop(guard);

        let mut pending = PendingChanges::default();
        for DirtyFolder {
            folder,
            local_version,
        } in folders
        {
            pending.versions.insert(folder.id, local_version);
            pending.records.push(SyncRecord::Folder(folder.into()));
        }
        for DirtyItem {
            item,
            local_version,
        } in items
        {
            let file_bytes = match self.payload_of(&item).await {
                Ok(ItemPayload::File { bytes, .. }) => Some(bytes.to_vec()),
                Ok(ItemPayload::Text(_)) => None,
                Err(StoreError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                    warn!(item = %item.id, "payload missing on disk, not pushing item");
                    continue;
                }
                Err(err) => return Err(err),
            };
            pending.versions.insert(item.id, local_version);
            pending.records.push(SyncRecord::Item(ItemRecord {
                id: item.id,
                folder_id: item.folder_id,
                key: item.key,
                kind: item.kind,
                text_value: item.text_value,
                file_name: item.file_name,
                file_bytes,
                created_at: item.created_at,
                key_updated_at: item.key_updated_at,
                text_updated_at: item.text_updated_at,
            }));
        }
        pending
            .records
            .extend(tombstones.into_iter().map(SyncRecord::Tombstone));
        Ok(pending)
    }

    /// Record a push acknowledgement.
    ///
    /// A record stays dirty when it changed locally after the snapshot was
    /// taken; acknowledged tombstones are dropped.
    pub async fn mark_pushed(&self, pending: &PendingChanges, ack: &PushAck) -> StoreResult<()> {
        let accepted: HashSet<Uuid> = ack.accepted.iter().copied().collect();
        let guard = self.write_lock.lock().await;
        let mut tx = self.db.begin().await?;
        for record in pending.records.iter().filter(|r| accepted.contains(&r.id())) {
            let id = record.id();
            let version = pending.versions.get(&id).copied().unwrap_or_default();
            match record {
                SyncRecord::Folder(_) => {
                    sqlx::query("UPDATE folders SET dirty = 0 WHERE id = ? AND local_version = ?")
                        .bind(id)
                        .bind(version)
                        .execute(&mut *tx)
                        .await?;
                }
                SyncRecord::Item(_) => {
                    sqlx::query("UPDATE items SET dirty = 0 WHERE id = ? AND local_version = ?")
                        .bind(id)
                        .bind(version)
                        .execute(&mut *tx)
                        .await?;
                }
                SyncRecord::Tombstone(_) => {
                    sqlx::query("DELETE FROM tombstones WHERE id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        drop(guard);
        debug!(accepted = accepted.len(), "recorded push acknowledgement");
        Ok(())
    }

    pub async fn sync_token(&self) -> StoreResult<Option<ChangeToken>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT state_value FROM sync_state WHERE state_key = ?",
        )
        .bind(TOKEN_STATE_KEY)
        .fetch_optional(&*self.db)
        .await?;
        Ok(value
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(ChangeToken))
    }

    /// Merge a pulled batch and store its token, all in one transaction.
    ///
    /// Remote field values win only when their timestamp is newer. Records
    /// covered by a pending local tombstone are ignored. Returns the number
    /// of changes applied.
    pub async fn apply_remote(&self, batch: &PullBatch) -> StoreResult<usize> {
        let guard = self.write_lock.lock().await;
        let mut written = Vec::new();
        let result = self.merge_batch(batch, &mut written).await;
        drop(guard);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.blobs.remove_all(&written).await;
                return Err(err);
            }
        };
        self.blobs.remove_all(&outcome.removed_blobs).await;
        debug!(
            applied = outcome.events.len(),
            token = %batch.new_token,
            "merged remote changes"
        );
        self.hub.publish(&outcome.events);
        Ok(outcome.events.len())
    }

    async fn merge_batch(
        &self,
        batch: &PullBatch,
        written: &mut Vec<String>,
    ) -> StoreResult<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        let mut tx = self.db.begin().await?;

        // Folders before items so new items find their owner.
        for record in &batch.records {
            if let SyncRecord::Folder(folder) = record {
                if let Some(event) = merge_folder(&mut tx, folder).await? {
                    outcome.events.push(event);
                }
            }
        }
        for record in &batch.records {
            if let SyncRecord::Item(item) = record {
                if let Some(event) = self.merge_item(&mut tx, item, written).await? {
                    outcome.events.push(event);
                }
            }
        }
        for record in &batch.records {
            if let SyncRecord::Tombstone(tombstone) = record {
                merge_tombstone(&mut tx, tombstone, &mut outcome).await?;
            }
        }

        sqlx::query(
            "INSERT INTO sync_state (state_key, state_value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(state_key) DO UPDATE SET
                state_value = excluded.state_value,
                updated_at = excluded.updated_at",
        )
        .bind(TOKEN_STATE_KEY)
        .bind(batch.new_token.0.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn merge_item(
        &self,
        conn: &mut SqliteConnection,
        record: &ItemRecord,
        written: &mut Vec<String>,
    ) -> StoreResult<Option<ChangeEvent>> {
        if let Err(err) = validate_payload(
            &record.key,
            record.kind,
            record.text_value.as_deref(),
            record.file_bytes.as_deref(),
        ) {
            warn!(item = %record.id, error = %err, "skipping malformed remote item");
            return Ok(None);
        }
        if has_tombstone(conn, record.id).await? || has_tombstone(conn, record.folder_id).await? {
            debug!(item = %record.id, "remote item suppressed by local tombstone");
            return Ok(None);
        }

        if let Some(local) = fetch_item(conn, record.id).await? {
            let take_key = record.key_updated_at > local.key_updated_at;
            let take_text = local.kind.is_text() && record.text_updated_at > local.text_updated_at;
            if !take_key && !take_text {
                return Ok(None);
            }
            let mut builder = QueryBuilder::<Sqlite>::new("UPDATE items SET ");
            {
                let mut fields = builder.separated(", ");
                if take_key {
                    fields
                        .push("key = ")
                        .push_bind_unseparated(record.key.clone());
                    fields
                        .push("key_updated_at = ")
                        .push_bind_unseparated(record.key_updated_at);
                }
                if take_text {
                    fields
                        .push("text_value = ")
                        .push_bind_unseparated(record.text_value.clone());
                    fields
                        .push("text_updated_at = ")
                        .push_bind_unseparated(record.text_updated_at);
                }
            }
            builder.push(" WHERE id = ");
            builder.push_bind(record.id);
            builder.build().execute(&mut *conn).await?;
            return Ok(Some(ChangeEvent::remote(
                ChangeAction::Updated,
                EntityKind::Item,
                record.id,
            )));
        }

        if !folder_exists(conn, record.folder_id).await? {
            warn!(
                item = %record.id,
                folder = %record.folder_id,
                "skipping remote item whose folder is not present locally"
            );
            return Ok(None);
        }

        let payload = self
            .store_payload(record.id, record.file_bytes.clone().map(Bytes::from))
            .await?;
        if let Some(path) = payload.blob_path() {
            written.push(path.to_string());
        }
        insert_item_row(
            conn,
            &ItemRow {
                id: record.id,
                folder_id: record.folder_id,
                key: &record.key,
                kind: record.kind,
                text_value: record.text_value.as_deref(),
                file_name: record.file_name.as_deref(),
                payload: &payload,
                created_at: record.created_at,
                key_updated_at: record.key_updated_at,
                text_updated_at: record.text_updated_at,
                dirty: false,
            },
        )
        .await?;
        Ok(Some(ChangeEvent::remote(
            ChangeAction::Added,
            EntityKind::Item,
            record.id,
        )))
    }
}

fn ensure_not_blank(value: &str, field: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::Validation(format!("{} must not be blank", field)));
    }
    Ok(())
}

/// Check that an item's key and kind-specific payload are usable.
fn validate_payload(
    key: &str,
    kind: ItemKind,
    text_value: Option<&str>,
    file_bytes: Option<&[u8]>,
) -> StoreResult<()> {
    ensure_not_blank(key, "key")?;
    if kind.is_text() {
        match text_value {
            Some(text) => ensure_not_blank(text, "text value")?,
            None => {
                return Err(StoreError::Validation(
                    "text items require a text value".into(),
                ));
            }
        }
        if file_bytes.is_some() {
            return Err(StoreError::Validation(
                "text items cannot carry file bytes".into(),
            ));
        }
    } else {
        match file_bytes {
            Some(bytes) if !bytes.is_empty() => {}
            _ => {
                return Err(StoreError::Validation(format!(
                    "{} items require file bytes",
                    kind
                )));
            }
        }
        if text_value.is_some() {
            return Err(StoreError::Validation(format!(
                "{} items cannot carry a text value",
                kind
            )));
        }
    }
    Ok(())
}

async fn fetch_folder(conn: &mut SqliteConnection, id: Uuid) -> StoreResult<Option<Folder>> {
    let folder = sqlx::query_as::<_, Folder>(&format!(
        "SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(folder)
}

async fn fetch_item(conn: &mut SqliteConnection, id: Uuid) -> StoreResult<Option<Item>> {
    let item = sqlx::query_as::<_, Item>(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(item)
}

async fn folder_exists(conn: &mut SqliteConnection, id: Uuid) -> StoreResult<bool> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM folders WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

async fn has_tombstone(conn: &mut SqliteConnection, id: Uuid) -> StoreResult<bool> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tombstones WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

async fn insert_item_row(conn: &mut SqliteConnection, row: &ItemRow<'_>) -> StoreResult<Item> {
    let item = sqlx::query_as::<_, Item>(&format!(
        "INSERT INTO items (
            id, folder_id, key, kind, text_value, file_name, inline_bytes, blob_path,
            size_bytes, checksum, created_at, key_updated_at, text_updated_at,
            dirty, local_version, published
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
        RETURNING {ITEM_COLUMNS}"
    ))
    .bind(row.id)
    .bind(row.folder_id)
    .bind(row.key)
    .bind(row.kind)
    .bind(row.text_value)
    .bind(row.file_name)
    .bind(row.payload.inline_bytes())
    .bind(row.payload.blob_path())
    .bind(row.payload.size_bytes())
    .bind(row.payload.checksum())
    .bind(row.created_at)
    .bind(row.key_updated_at)
    .bind(row.text_updated_at)
    .bind(row.dirty)
    // rows pulled from the remote are published from the start
    .bind(!row.dirty)
    .fetch_one(&mut *conn)
    .await?;
    Ok(item)
}

/// An item row removed along with its folder.
#[derive(FromRow)]
struct RemovedItem {
    id: Uuid,
    blob_path: Option<String>,
    published: bool,
}

/// Delete a folder row and its items. Returns whether the folder was
/// published plus the removed items, or `None` if the folder does not exist.
async fn remove_folder_rows(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> StoreResult<Option<(bool, Vec<RemovedItem>)>> {
    let items = sqlx::query_as::<_, RemovedItem>(
        "SELECT id, blob_path, published FROM items WHERE folder_id = ?",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM items WHERE folder_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    let published =
        sqlx::query_scalar::<_, bool>("DELETE FROM folders WHERE id = ? RETURNING published")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

    Ok(published.map(|published| (published, items)))
}

/// Delete one item row. Returns its blob path and published flag, or `None`
/// if it does not exist.
async fn remove_item_row(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> StoreResult<Option<(Option<String>, bool)>> {
    let removed = sqlx::query_as::<_, (Option<String>, bool)>(
        "DELETE FROM items WHERE id = ? RETURNING blob_path, published",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(removed)
}

async fn write_tombstone(
    conn: &mut SqliteConnection,
    entity: EntityKind,
    id: Uuid,
    deleted_at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO tombstones (id, entity, deleted_at) VALUES (?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET deleted_at = excluded.deleted_at",
    )
    .bind(id)
    .bind(entity)
    .bind(deleted_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn merge_folder(
    conn: &mut SqliteConnection,
    record: &FolderRecord,
) -> StoreResult<Option<ChangeEvent>> {
    if record.name.trim().is_empty() {
        warn!(folder = %record.id, "skipping remote folder with a blank name");
        return Ok(None);
    }
    if has_tombstone(conn, record.id).await? {
        debug!(folder = %record.id, "remote folder suppressed by local tombstone");
        return Ok(None);
    }

    match fetch_folder(conn, record.id).await? {
        Some(local) if record.name_updated_at > local.name_updated_at => {
            sqlx::query("UPDATE folders SET name = ?, name_updated_at = ? WHERE id = ?")
                .bind(&record.name)
                .bind(record.name_updated_at)
                .bind(record.id)
                .execute(&mut *conn)
                .await?;
            Ok(Some(ChangeEvent::remote(
                ChangeAction::Updated,
                EntityKind::Folder,
                record.id,
            )))
        }
        Some(_) => Ok(None),
        None => {
            sqlx::query(
                "INSERT INTO folders
                    (id, name, created_at, name_updated_at, dirty, local_version, published)
                 VALUES (?, ?, ?, ?, 0, 1, 1)",
            )
            .bind(record.id)
            .bind(&record.name)
            .bind(record.created_at)
            .bind(record.name_updated_at)
            .execute(&mut *conn)
            .await?;
            Ok(Some(ChangeEvent::remote(
                ChangeAction::Added,
                EntityKind::Folder,
                record.id,
            )))
        }
    }
}

/// A remote delete removes the local entity, even one with unpushed edits.
async fn merge_tombstone(
    conn: &mut SqliteConnection,
    record: &TombstoneRecord,
    outcome: &mut MergeOutcome,
) -> StoreResult<()> {
    match record.entity {
        EntityKind::Folder => {
            if let Some((_, removed)) = remove_folder_rows(conn, record.id).await? {
                for item in removed {
                    outcome.removed_blobs.extend(item.blob_path);
                    outcome.events.push(ChangeEvent::remote(
                        ChangeAction::Removed,
                        EntityKind::Item,
                        item.id,
                    ));
                }
                outcome.events.push(ChangeEvent::remote(
                    ChangeAction::Removed,
                    EntityKind::Folder,
                    record.id,
                ));
            }
        }
        EntityKind::Item => {
            if let Some((blob_path, _)) = remove_item_row(conn, record.id).await? {
                outcome.removed_blobs.extend(blob_path);
                outcome.events.push(ChangeEvent::remote(
                    ChangeAction::Removed,
                    EntityKind::Item,
                    record.id,
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::change::ChangeOrigin;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir, inline_threshold: usize) -> JarStore {
        JarStore::open(&StoreOptions {
            database_url: format!("sqlite://{}", dir.path().join("jar.db").display()),
            blob_dir: dir.path().join("blobs"),
            inline_threshold,
            max_connections: 4,
        })
        .await
        .unwrap()
    }

    fn record_events(store: &JarStore) -> (Arc<StdMutex<Vec<ChangeEvent>>>, Subscription) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = store.subscribe(move |event| sink.lock().unwrap().push(*event));
        (seen, sub)
    }

    #[tokio::test]
    async fn blank_folder_name_defaults() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;

        let folder = store.create_folder("").await.unwrap();
        assert_eq!(folder.name, "Folder");
        let spaced = store.create_folder("   ").await.unwrap();
        assert_eq!(spaced.name, "Folder");
        let named = store.create_folder("Recipes").await.unwrap();
        assert_eq!(store.get_folder(named.id).await.unwrap().name, "Recipes");
    }

    #[tokio::test]
    async fn rename_rejects_blank_and_unknown() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("Old").await.unwrap();

        let err = store.rename_folder(folder.id, " \t ").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.get_folder(folder.id).await.unwrap().name, "Old");

        let err = store
            .rename_folder(Uuid::new_v4(), "New")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FolderNotFound(_)));

        let renamed = store.rename_folder(folder.id, "New").await.unwrap();
        assert_eq!(renamed.name, "New");
        assert!(renamed.name_updated_at >= folder.name_updated_at);
    }

    #[tokio::test]
    async fn folders_listed_by_name() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        for name in ["Work", "Alpha", "Music"] {
            store.create_folder(name).await.unwrap();
        }
        let names: Vec<String> = store
            .list_folders()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "Music", "Work"]);
    }

    #[tokio::test]
    async fn malformed_items_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("F").await.unwrap();

        let cases = vec![
            NewItem::text("  ", "body"),
            NewItem::text("key", "   "),
            NewItem {
                text_value: None,
                ..NewItem::text("key", "x")
            },
            NewItem::file(ItemKind::Photo, "pic", None, Bytes::new()),
            NewItem {
                text_value: Some("oops".into()),
                ..NewItem::file(ItemKind::Document, "doc", None, &b"pdf"[..])
            },
        ];
        for new in cases {
            let err = store.create_item(folder.id, new).await.unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "{err}");
        }

        let err = store
            .create_item(Uuid::new_v4(), NewItem::text("k", "v"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FolderNotFound(_)));
        assert_eq!(store.item_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn items_listed_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("F").await.unwrap();

        for key in ["t1", "t2", "t3"] {
            store
                .create_item(folder.id, NewItem::text(key, "body"))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let keys: Vec<String> = store
            .list_items(folder.id)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.key)
            .collect();
        assert_eq!(keys, vec!["t3", "t2", "t1"]);
    }

    #[tokio::test]
    async fn large_payloads_go_out_of_line() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 8).await;
        let folder = store.create_folder("Media").await.unwrap();

        let small = store
            .create_item(
                folder.id,
                NewItem::file(ItemKind::Photo, "small", Some("a.jpg".into()), &b"tiny"[..]),
            )
            .await
            .unwrap();
        assert!(!small.is_external());
        assert_eq!(small.checksum.as_deref(), Some(checksum_of(b"tiny").as_str()));

        let bytes = vec![7u8; 1024];
        let large = store
            .create_item(
                folder.id,
                NewItem::file(ItemKind::Video, "clip", Some("clip.mov".into()), bytes.clone()),
            )
            .await
            .unwrap();
        assert!(large.is_external());
        assert_eq!(large.size_bytes, 1024);

        match store.read_payload(large.id).await.unwrap() {
            ItemPayload::File { file_name, bytes: read } => {
                assert_eq!(file_name.as_deref(), Some("clip.mov"));
                assert_eq!(read.to_vec(), bytes);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let blob_path = large.blob_path.clone().unwrap();
        store.delete_item(large.id).await.unwrap();
        assert!(store.blobs().read(&blob_path).await.is_err());
    }

    #[tokio::test]
    async fn camera_capture_gets_generated_name() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("F").await.unwrap();
        let item = store
            .create_item(
                folder.id,
                NewItem::file(ItemKind::Camera, "snap", None, &b"jpeg"[..]),
            )
            .await
            .unwrap();
        let name = item.file_name.unwrap();
        assert!(name.starts_with("Camera-") && name.ends_with(".jpg"), "{name}");
    }

    #[tokio::test]
    async fn delete_folder_cascades_to_items_and_blobs() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4).await;
        let folder = store.create_folder("Doomed").await.unwrap();
        let keep = store.create_folder("Keep").await.unwrap();
        let text = store
            .create_item(folder.id, NewItem::text("note", "body"))
            .await
            .unwrap();
        let doc = store
            .create_item(
                folder.id,
                NewItem::file(ItemKind::Document, "doc", Some("a.pdf".into()), vec![1u8; 64]),
            )
            .await
            .unwrap();
        store
            .create_item(keep.id, NewItem::text("other", "body"))
            .await
            .unwrap();
        let (events, _sub) = record_events(&store);

        store.delete_folder(folder.id).await.unwrap();

        assert!(store.list_items(folder.id).await.unwrap().is_empty());
        assert_eq!(store.item_count().await.unwrap(), 1);
        assert!(matches!(
            store.get_folder(folder.id).await,
            Err(StoreError::FolderNotFound(_))
        ));
        assert!(
            store
                .blobs()
                .read(doc.blob_path.as_deref().unwrap())
                .await
                .is_err()
        );

        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 3);
        assert!(events.iter().any(|e| e.id == text.id));
        assert_eq!(events.last().unwrap().entity, EntityKind::Folder);

        let err = store.delete_folder(folder.id).await.unwrap_err();
        assert!(matches!(err, StoreError::FolderNotFound(_)));
    }

    #[tokio::test]
    async fn batch_delete_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("F").await.unwrap();
        let a = store
            .create_item(folder.id, NewItem::text("a", "1"))
            .await
            .unwrap();

        let err = store
            .delete_items(&[a.id, Uuid::new_v4()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ItemNotFound(_)));
        assert_eq!(store.item_count().await.unwrap(), 1);

        store.delete_items(&[a.id, a.id]).await.unwrap();
        assert_eq!(store.item_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn partial_update_leaves_other_fields() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("F").await.unwrap();
        let note = store
            .create_item(folder.id, NewItem::text("todo", "milk"))
            .await
            .unwrap();
        let photo = store
            .create_item(
                folder.id,
                NewItem::file(ItemKind::Photo, "pic", Some("p.jpg".into()), &b"img"[..]),
            )
            .await
            .unwrap();

        let updated = store
            .update_item(
                note.id,
                ItemUpdate {
                    key: Some("shopping".into()),
                    text_value: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.key, "shopping");
        assert_eq!(updated.text_value.as_deref(), Some("milk"));
        assert_eq!(updated.text_updated_at, note.text_updated_at);

        store
            .update_item(
                photo.id,
                ItemUpdate {
                    key: Some("holiday".into()),
                    text_value: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.read_payload(photo.id).await.unwrap(),
            ItemPayload::File {
                file_name: Some("p.jpg".into()),
                bytes: Bytes::from_static(b"img"),
            }
        );

        let err = store
            .update_item(
                photo.id,
                ItemUpdate {
                    key: None,
                    text_value: Some("caption".into()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let err = store
            .update_item(
                note.id,
                ItemUpdate {
                    key: Some(" ".into()),
                    text_value: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn subscribers_see_committed_changes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let (events, sub) = record_events(&store);

        let folder = store.create_folder("F").await.unwrap();
        let item = store
            .create_item(folder.id, NewItem::text("k", "v"))
            .await
            .unwrap();
        let _ = store.create_item(folder.id, NewItem::text("", "v")).await;
        drop(sub);
        store.delete_item(item.id).await.unwrap();

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ChangeEvent::local(ChangeAction::Added, EntityKind::Folder, folder.id),
                ChangeEvent::local(ChangeAction::Added, EntityKind::Item, item.id),
            ]
        );
    }

    #[tokio::test]
    async fn push_ack_keeps_records_edited_after_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("F").await.unwrap();
        let item = store
            .create_item(folder.id, NewItem::text("k", "v"))
            .await
            .unwrap();
        let gone = store
            .create_item(folder.id, NewItem::text("gone", "v"))
            .await
            .unwrap();
        store.delete_item(gone.id).await.unwrap();

        // "gone" never reached a snapshot, so it leaves no tombstone
        let pending = store.pending_changes().await.unwrap();
        assert_eq!(pending.len(), 2);

        store
            .update_item(
                item.id,
                ItemUpdate {
                    key: Some("edited".into()),
                    text_value: None,
                },
            )
            .await
            .unwrap();
        let ack = PushAck {
            accepted: pending.records.iter().map(SyncRecord::id).collect(),
        };
        store.mark_pushed(&pending, &ack).await.unwrap();

        let remaining = store.pending_changes().await.unwrap();
        let ids: Vec<Uuid> = remaining.records.iter().map(SyncRecord::id).collect();
        assert_eq!(ids, vec![item.id]);
    }

    #[tokio::test]
    async fn remote_merge_is_field_level_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("Local").await.unwrap();
        let item = store
            .create_item(folder.id, NewItem::text("key", "body"))
            .await
            .unwrap();
        let (events, _sub) = record_events(&store);

        let later = Utc::now() + chrono::Duration::seconds(60);
        let earlier = item.created_at - chrono::Duration::seconds(60);
        let batch = PullBatch {
            records: vec![
                SyncRecord::Folder(FolderRecord {
                    id: folder.id,
                    name: "Stale".into(),
                    created_at: folder.created_at,
                    name_updated_at: earlier,
                }),
                SyncRecord::Item(ItemRecord {
                    id: item.id,
                    folder_id: folder.id,
                    key: "remote key".into(),
                    kind: ItemKind::Text,
                    text_value: Some("old remote body".into()),
                    file_name: None,
                    file_bytes: None,
                    created_at: item.created_at,
                    key_updated_at: later,
                    text_updated_at: earlier,
                }),
            ],
            new_token: ChangeToken(7),
        };

        assert_eq!(store.apply_remote(&batch).await.unwrap(), 1);
        let merged = store.get_item(item.id).await.unwrap();
        assert_eq!(merged.key, "remote key");
        assert_eq!(merged.text_value.as_deref(), Some("body"));
        assert_eq!(store.get_folder(folder.id).await.unwrap().name, "Local");
        assert_eq!(store.sync_token().await.unwrap(), Some(ChangeToken(7)));
        assert!(
            events
                .lock()
                .unwrap()
                .iter()
                .all(|e| e.origin == ChangeOrigin::Remote)
        );
    }

    #[tokio::test]
    async fn local_tombstone_blocks_resurrection() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("F").await.unwrap();
        let item = store
            .create_item(folder.id, NewItem::text("k", "v"))
            .await
            .unwrap();
        store.pending_changes().await.unwrap();
        store.delete_folder(folder.id).await.unwrap();

        let stale = PullBatch {
            records: vec![
                SyncRecord::Folder(FolderRecord {
                    id: folder.id,
                    name: "F".into(),
                    created_at: folder.created_at,
                    name_updated_at: folder.name_updated_at,
                }),
                SyncRecord::Item(ItemRecord {
                    id: item.id,
                    folder_id: folder.id,
                    key: "k".into(),
                    kind: ItemKind::Text,
                    text_value: Some("v".into()),
                    file_name: None,
                    file_bytes: None,
                    created_at: item.created_at,
                    key_updated_at: item.key_updated_at,
                    text_updated_at: item.text_updated_at,
                }),
            ],
            new_token: ChangeToken(1),
        };
        assert_eq!(store.apply_remote(&stale).await.unwrap(), 0);
        assert!(store.list_folders().await.unwrap().is_empty());
        assert_eq!(store.item_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remote_tombstone_and_orphans() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("F").await.unwrap();
        store
            .create_item(folder.id, NewItem::text("k", "v"))
            .await
            .unwrap();

        let now = Utc::now();
        let batch = PullBatch {
            records: vec![
                SyncRecord::Item(ItemRecord {
                    id: Uuid::new_v4(),
                    folder_id: Uuid::new_v4(),
                    key: "orphan".into(),
                    kind: ItemKind::Text,
                    text_value: Some("v".into()),
                    file_name: None,
                    file_bytes: None,
                    created_at: now,
                    key_updated_at: now,
                    text_updated_at: now,
                }),
                SyncRecord::Tombstone(TombstoneRecord {
                    id: folder.id,
                    entity: EntityKind::Folder,
                    deleted_at: now,
                }),
            ],
            new_token: ChangeToken(3),
        };

        assert_eq!(store.apply_remote(&batch).await.unwrap(), 2);
        assert_eq!(store.item_count().await.unwrap(), 0);
        assert!(store.list_folders().await.unwrap().is_empty());
        // remote deletes do not produce tombstones of our own to push
        assert!(store.pending_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unpublished_deletes_leave_no_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4).await;
        let folder = store.create_folder("Scratch").await.unwrap();
        for i in 0..50 {
            let item = store
                .create_item(folder.id, NewItem::text(format!("k{i}"), "v"))
                .await
                .unwrap();
            store.delete_item(item.id).await.unwrap();
        }

        let pending = store.pending_changes().await.unwrap();
        let ids: Vec<Uuid> = pending.records.iter().map(SyncRecord::id).collect();
        assert_eq!(ids, vec![folder.id]);

        let other = store.create_folder("Other").await.unwrap();
        store
            .create_item(
                other.id,
                NewItem::file(ItemKind::Document, "doc", None, vec![7u8; 16]),
            )
            .await
            .unwrap();
        store.delete_folder(other.id).await.unwrap();
        let ids: Vec<Uuid> = store
            .pending_changes()
            .await
            .unwrap()
            .records
            .iter()
            .map(SyncRecord::id)
            .collect();
        assert_eq!(ids, vec![folder.id]);
    }

    #[tokio::test]
    async fn snapshot_rows_leave_tombstones_even_without_ack() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let folder = store.create_folder("F").await.unwrap();
        let item = store
            .create_item(folder.id, NewItem::text("k", "v"))
            .await
            .unwrap();
        let late = store
            .create_item(folder.id, NewItem::text("late", "v"))
            .await
            .unwrap();

        // the push may have landed even though no ack came back
        let snapshot = store.pending_changes().await.unwrap();
        assert_eq!(snapshot.len(), 3);
        store.delete_item(item.id).await.unwrap();

        let pending = store.pending_changes().await.unwrap();
        assert!(pending.records.iter().any(|r| matches!(
            r,
            SyncRecord::Tombstone(t) if t.id == item.id && t.entity == EntityKind::Item
        )));

        store.delete_folder(folder.id).await.unwrap();
        let tombstones: HashSet<Uuid> = store
            .pending_changes()
            .await
            .unwrap()
            .records
            .iter()
            .filter(|r| matches!(r, SyncRecord::Tombstone(_)))
            .map(SyncRecord::id)
            .collect();
        assert_eq!(tombstones, HashSet::from([folder.id, item.id, late.id]));
    }

    #[tokio::test]
    async fn pulled_rows_are_published() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, DEFAULT_INLINE_THRESHOLD).await;
        let now = Utc::now();
        let folder_id = Uuid::new_v4();
        let item_id = Uuid::new_v4();
        let batch = PullBatch {
            records: vec![
                SyncRecord::Folder(FolderRecord {
                    id: folder_id,
                    name: "Remote".into(),
                    created_at: now,
                    name_updated_at: now,
                }),
                SyncRecord::Item(ItemRecord {
                    id: item_id,
                    folder_id,
                    key: "k".into(),
                    kind: ItemKind::Text,
                    text_value: Some("v".into()),
                    file_name: None,
                    file_bytes: None,
                    created_at: now,
                    key_updated_at: now,
                    text_updated_at: now,
                }),
            ],
            new_token: ChangeToken(1),
        };
        assert_eq!(store.apply_remote(&batch).await.unwrap(), 2);
        assert!(store.pending_changes().await.unwrap().is_empty());

        store.delete_item(item_id).await.unwrap();
        let ids: Vec<Uuid> = store
            .pending_changes()
            .await
            .unwrap()
            .records
            .iter()
            .map(SyncRecord::id)
            .collect();
        assert_eq!(ids, vec![item_id]);
    }

    #[tokio::test]
    async fn reopen_sweeps_orphaned_blobs() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4).await;
        let folder = store.create_folder("Docs").await.unwrap();
        let kept = store
            .create_item(
                folder.id,
                NewItem::file(ItemKind::Document, "kept", Some("k.pdf".into()), vec![3u8; 64]),
            )
            .await
            .unwrap();
        let orphan = store
            .blobs()
            .write(Uuid::new_v4(), Bytes::from_static(b"never committed"))
            .await
            .unwrap();
        let kept_path = kept.blob_path.clone().unwrap();
        let leftover = store
            .blobs()
            .base_path()
            .join(&kept_path)
            .with_file_name(format!(".tmp-{}", Uuid::new_v4()));
        std::fs::write(&leftover, b"partial").unwrap();
        drop(store);

        let store = open_store(&dir, 4).await;
        assert!(store.blobs().read(&orphan.relative_path).await.is_err());
        assert!(!leftover.exists());
        assert_eq!(store.blobs().list().await.unwrap(), vec![kept_path]);
        match store.read_payload(kept.id).await.unwrap() {
            ItemPayload::File { bytes, .. } => assert_eq!(bytes.to_vec(), vec![3u8; 64]),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
