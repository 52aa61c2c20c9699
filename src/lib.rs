//! Personal content organizer: folders of jar items kept in a local
//! transactional store and synced to a remote backend in the background.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
