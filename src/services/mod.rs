pub mod blob_store;
pub mod change_hub;
pub mod query;
pub mod remote;
pub mod retry;
pub mod store_service;
pub mod sync_service;
