use crate::{
    models::item::Capabilities,
    services::{store_service::JarStore, sync_service::SyncHandle},
};

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub store: JarStore,
    pub sync: SyncHandle,
    pub capabilities: Capabilities,
}
