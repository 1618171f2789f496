pub mod backup_paths;
pub mod collaborators;
pub mod config;
pub mod contacts;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod extractor;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod query;
pub mod resolver;
pub mod seed;
pub mod timestamp;
mod migrations;

pub use config::SyncConfig;
pub use db::{open_archive, ArchiveDb};
pub use error::CoreError;
pub use extractor::BackupExtractor;
pub use loader::PersistenceLoader;
pub use orchestrator::{Collaborators, SyncEvent, SyncOptions, SyncOrchestrator};
