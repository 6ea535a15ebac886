//! Capabilities the sync core consumes
//!
//! The network itself is out of reach of this crate: fetching, publishing and
//! update notification are injected as trait objects. [`super::simulated`]
//! provides an in-process implementation of all three.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::TransportError;
use crate::data::Locator;

/// Bytes returned by a successful fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchResult {
    pub data: Vec<u8>,
    pub content_type: String,
    /// Edition the bytes were served from.
    pub edition: u64,
}

/// One named file of a published manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub data: Vec<u8>,
    pub content_type: String,
}

impl ManifestEntry {
    pub fn new(data: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            content_type: content_type.into(),
        }
    }
}

/// Name → entry map inserted as one unit.
pub type Manifest = BTreeMap<String, ManifestEntry>;

/// Invoked with the newly available edition when a watched locator updates.
pub type UpdateCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Identifies one watch registration; several may share a locator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

#[async_trait]
pub trait FetchCapability: Send + Sync {
    /// Fetch the resource named by `locator`.
    ///
    /// `Ok(None)` means nothing was found at this edition; that is not an
    /// error, just a reason to wait for the next notification.
    async fn fetch(&self, locator: &Locator) -> Result<Option<FetchResult>, TransportError>;
}

#[async_trait]
pub trait PublishCapability: Send + Sync {
    /// Insert `manifest` under the private `locator`. The network chooses the
    /// edition actually used and returns the final locator.
    async fn publish(
        &self,
        locator: &Locator,
        manifest: Manifest,
        default_entry: &str,
    ) -> Result<Locator, TransportError>;
}

pub trait UpdateWatcher: Send + Sync {
    /// Start calling `on_update` whenever a new edition of `locator` appears.
    fn register_watch(&self, locator: &Locator, on_update: UpdateCallback) -> WatchId;

    /// Drop the registration `watch`. Other registrations on the same
    /// locator keep firing.
    fn unregister_watch(&self, locator: &Locator, watch: WatchId);
}
