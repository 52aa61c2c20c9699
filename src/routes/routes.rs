//! Defines routes for the jar organizer API.
//!
//! ## Structure
//! - **Probes**: `GET /healthz`, `GET /readyz`
//! - **Kinds**: `GET /kinds` (creatable kinds with label, icon and color)
//! - **Folders**
//!   - `GET    /folders`, `POST /folders`
//!   - `PATCH  /folders/{id}` (rename), `DELETE /folders/{id}` (cascades to items)
//!   - `GET    /folders/{id}/items?q=`, `POST /folders/{id}/items`
//!   - `POST   /folders/{id}/items/upload` (multipart)
//! - **Items**
//!   - `GET|PATCH|DELETE /items/{id}`, `GET /items/{id}/content`
//!   - `POST   /items/delete` (batch)
//! - **Sync**: `GET /sync/status`, `POST /sync`

use crate::{
    handlers::{
        folder_handlers::{create_folder, delete_folder, list_folders, rename_folder},
        health_handlers::{healthz, readyz},
        item_handlers::{
            create_item, delete_item, delete_items, get_item, get_item_content, list_items,
            list_kinds, update_item, upload_item,
        },
        sync_handlers::{sync_status, trigger_sync},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
};

/// Uploads larger than this are rejected before reaching the store.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Build the router. Handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/kinds", get(list_kinds))
        // folders
        .route("/folders", get(list_folders).post(create_folder))
        .route("/folders/{id}", patch(rename_folder).delete(delete_folder))
        .route("/folders/{id}/items", get(list_items).post(create_item))
        .route("/folders/{id}/items/upload", post(upload_item))
        // items
        .route("/items/delete", post(delete_items))
        .route(
            "/items/{id}",
            get(get_item).patch(update_item).delete(delete_item),
        )
        .route("/items/{id}/content", get(get_item_content))
        // sync
        .route("/sync", post(trigger_sync))
        .route("/sync/status", get(sync_status))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
