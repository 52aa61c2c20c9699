//! Represents a jar item, one piece of stored content of a fixed kind.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The kind of content an item holds. Fixed at creation.
///
/// Each kind carries its own presentation metadata so callers never look
/// labels or icons up by position.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ItemKind {
    Text,
    Photo,
    Camera,
    Video,
    Document,
}

impl ItemKind {
    pub const ALL: [ItemKind; 5] = [
        ItemKind::Text,
        ItemKind::Photo,
        ItemKind::Camera,
        ItemKind::Video,
        ItemKind::Document,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ItemKind::Text => "Text",
            ItemKind::Photo => "Photo",
            ItemKind::Camera => "Camera",
            ItemKind::Video => "Video",
            ItemKind::Document => "Document",
        }
    }

    /// Symbol name used by front-ends for this kind.
    pub fn icon(self) -> &'static str {
        match self {
            ItemKind::Text => "character.cursor.ibeam",
            ItemKind::Photo => "photo",
            ItemKind::Camera => "camera",
            ItemKind::Video => "video",
            ItemKind::Document => "doc",
        }
    }

    /// Accent color name used by front-ends for this kind.
    pub fn color(self) -> &'static str {
        match self {
            ItemKind::Text => "teal",
            ItemKind::Photo => "yellow",
            ItemKind::Camera => "green",
            ItemKind::Video => "purple",
            ItemKind::Document => "orange",
        }
    }

    /// Text items carry a body; every other kind carries file bytes.
    pub fn is_text(self) -> bool {
        matches!(self, ItemKind::Text)
    }

    /// Kinds a user can create on a device with the given capabilities.
    pub fn available(caps: &Capabilities) -> Vec<ItemKind> {
        Self::ALL
            .into_iter()
            .filter(|kind| *kind != ItemKind::Camera || caps.camera_available)
            .collect()
    }

    /// File name for captured media that arrives without one.
    ///
    /// Only still images get a generated name; videos and documents keep the
    /// name supplied by the picker.
    pub fn default_file_name(self, now: DateTime<Utc>) -> Option<String> {
        match self {
            ItemKind::Photo | ItemKind::Camera => {
                Some(format!("{}-{}.jpg", self.label(), now.timestamp()))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// What the host device can do. Replaces per-platform code paths.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub camera_available: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            camera_available: true,
        }
    }
}

/// Presentation metadata for one kind, as served to front-ends.
#[derive(Serialize, Debug, Clone)]
pub struct KindInfo {
    pub kind: ItemKind,
    pub label: &'static str,
    pub icon: &'static str,
    pub color: &'static str,
}

impl From<ItemKind> for KindInfo {
    fn from(kind: ItemKind) -> Self {
        Self {
            kind,
            label: kind.label(),
            icon: kind.icon(),
            color: kind.color(),
        }
    }
}

/// A stored item. File bytes are not loaded here; use
/// `JarStore::read_payload` to fetch them.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Item {
    pub id: Uuid,

    /// Owning folder.
    pub folder_id: Uuid,

    /// Short user label.
    pub key: String,

    pub kind: ItemKind,

    /// Body for text items.
    pub text_value: Option<String>,

    /// Original file name for file items.
    pub file_name: Option<String>,

    /// Payload stored inside the row when small enough.
    #[serde(skip)]
    pub inline_bytes: Option<Vec<u8>>,

    /// Payload location relative to the blob root when stored out of line.
    #[serde(skip)]
    pub blob_path: Option<String>,

    /// Payload size in bytes (0 for text items).
    pub size_bytes: i64,

    /// Hex MD5 of the file payload.
    pub checksum: Option<String>,

    pub created_at: DateTime<Utc>,

    pub key_updated_at: DateTime<Utc>,

    pub text_updated_at: DateTime<Utc>,
}

impl Item {
    pub fn is_external(&self) -> bool {
        self.blob_path.is_some()
    }
}

/// Input for `JarStore::create_item`.
#[derive(Clone, Debug)]
pub struct NewItem {
    pub key: String,
    pub kind: ItemKind,
    pub text_value: Option<String>,
    pub file_name: Option<String>,
    pub file_bytes: Option<Bytes>,
}

impl NewItem {
    pub fn text(key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ItemKind::Text,
            text_value: Some(body.into()),
            file_name: None,
            file_bytes: None,
        }
    }

    pub fn file(
        kind: ItemKind,
        key: impl Into<String>,
        file_name: Option<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            kind,
            text_value: None,
            file_name,
            file_bytes: Some(bytes.into()),
        }
    }
}

/// Partial update for `JarStore::update_item`. Absent fields are untouched.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ItemUpdate {
    pub key: Option<String>,
    pub text_value: Option<String>,
}

/// Item content handed to external collaborators such as the clipboard or a
/// preview renderer.
#[derive(Clone, Debug, PartialEq)]
pub enum ItemPayload {
    Text(String),
    File { file_name: Option<String>, bytes: Bytes },
}
