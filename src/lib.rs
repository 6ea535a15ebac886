// Sone - Replicated Social Identity Documents

pub mod config;
pub mod data;
pub mod engine;
pub mod store;
pub mod sync;

pub use config::{ConfigError, DownloaderConfig, InserterConfig, SyncConfig};
pub use data::{Document, KnownDocument, Locator, Post, Profile, Reply};
pub use engine::SyncEngine;
pub use store::{DocumentStatus, DocumentStore};
pub use sync::{SyncError, TransportError, ValidationError};
