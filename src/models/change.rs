//! Change notifications published after every committed mutation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EntityKind {
    Folder,
    Item,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Added,
    Updated,
    Removed,
}

/// Who caused a change: a local caller or a merged remote record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub entity: EntityKind,
    pub id: Uuid,
    pub origin: ChangeOrigin,
}

impl ChangeEvent {
    pub fn local(action: ChangeAction, entity: EntityKind, id: Uuid) -> Self {
        Self {
            action,
            entity,
            id,
            origin: ChangeOrigin::Local,
        }
    }

    pub fn remote(action: ChangeAction, entity: EntityKind, id: Uuid) -> Self {
        Self {
            action,
            entity,
            id,
            origin: ChangeOrigin::Remote,
        }
    }
}
