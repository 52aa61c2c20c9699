pub mod folder_handlers;
pub mod health_handlers;
pub mod item_handlers;
pub mod sync_handlers;
