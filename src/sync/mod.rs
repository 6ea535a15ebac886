//! Synchronization: wire codec, transport capabilities, downloader and
//! inserters.

pub mod downloader;
mod error;
pub mod inserter;
pub mod simulated;
pub mod transport;
pub mod wire;

pub use downloader::{merge_document, Downloader, FetchOutcome, ParsedDocument};
pub use error::{SyncError, TransportError, ValidationError};
pub use inserter::{DebounceState, Inserter, InserterHandle, TickOutcome};
pub use simulated::MemoryNetwork;
pub use transport::{
    FetchCapability, FetchResult, Manifest, ManifestEntry, PublishCapability, UpdateCallback,
    UpdateWatcher, WatchId,
};
