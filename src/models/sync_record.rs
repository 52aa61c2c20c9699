//! Whole-record snapshots exchanged with a remote sync backend.

use super::{change::EntityKind, folder::Folder, item::ItemKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Opaque, server-assigned, monotonically increasing pull cursor.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChangeToken(pub u64);

impl std::fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FolderRecord {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub name_updated_at: DateTime<Utc>,
}

impl From<Folder> for FolderRecord {
    fn from(folder: Folder) -> Self {
        Self {
            id: folder.id,
            name: folder.name,
            created_at: folder.created_at,
            name_updated_at: folder.name_updated_at,
        }
    }
}

/// Item snapshot including its payload bytes, so the receiving side can
/// rebuild the item without a second fetch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ItemRecord {
    pub id: Uuid,
    pub folder_id: Uuid,
    pub key: String,
    pub kind: ItemKind,
    pub text_value: Option<String>,
    pub file_name: Option<String>,
    pub file_bytes: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub key_updated_at: DateTime<Utc>,
    pub text_updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct TombstoneRecord {
    pub id: Uuid,
    pub entity: EntityKind,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncRecord {
    Folder(FolderRecord),
    Item(ItemRecord),
    Tombstone(TombstoneRecord),
}

impl SyncRecord {
    pub fn id(&self) -> Uuid {
        match self {
            SyncRecord::Folder(f) => f.id,
            SyncRecord::Item(i) => i.id,
            SyncRecord::Tombstone(t) => t.id,
        }
    }
}

/// Remote acknowledgement of a push.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PushAck {
    pub accepted: Vec<Uuid>,
}

/// Records changed on the remote since a token, plus the token to resume from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PullBatch {
    pub records: Vec<SyncRecord>,
    pub new_token: ChangeToken,
}
