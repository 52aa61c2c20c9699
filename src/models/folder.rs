//! Represents a folder, a named container that owns jar items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Name given to folders created without one.
pub const DEFAULT_FOLDER_NAME: &str = "Folder";

/// A user-created folder.
///
/// Deleting a folder deletes every item it owns in the same transaction.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Folder {
    /// Unique identifier, assigned at creation and never changed.
    pub id: Uuid,

    /// Display name. Never blank once persisted.
    pub name: String,

    /// When this folder was created.
    pub created_at: DateTime<Utc>,

    /// When `name` was last written, locally or by a merged remote change.
    pub name_updated_at: DateTime<Utc>,
}
