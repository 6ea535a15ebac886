//! In-process publish/fetch network
//!
//! A content-addressed, versioned store shared by any number of simulated
//! nodes in one process. Manifests are stored per public key and edition;
//! every entry is kept by the SHA-256 of its bytes. Public keys are derived
//! from private keys by hashing, so a node holding the private locator can
//! publish and everyone holding the public locator can fetch and watch.
//!
//! Failure injection (offline mode, rejected publishes) and fetch gating let
//! tests drive the sync core through its error and concurrency paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use uuid::Uuid;

use super::transport::{
    FetchCapability, FetchResult, Manifest, PublishCapability, UpdateCallback, UpdateWatcher,
    WatchId,
};
use super::TransportError;
use crate::data::{KeyType, Locator};

/// Hex SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Public key matching a private key on the simulated network.
pub fn derive_request_key(insert_key: &str) -> String {
    content_hash(insert_key.as_bytes())
}

#[derive(Clone, Debug)]
struct StoredEntry {
    hash: String,
    content_type: String,
}

#[derive(Clone, Debug)]
struct PublishedEdition {
    entries: BTreeMap<String, StoredEntry>,
    default_entry: String,
}

type SiteKey = (String, String);

#[derive(Default)]
struct NetworkState {
    /// (public key, site) -> edition -> manifest
    sites: HashMap<SiteKey, BTreeMap<u64, PublishedEdition>>,
    /// content hash -> bytes
    blobs: HashMap<String, Vec<u8>>,
    watchers: HashMap<SiteKey, Vec<(WatchId, UpdateCallback)>>,
}

/// The shared "network" all simulated nodes talk to.
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
    offline: AtomicBool,
    failing_publishes: AtomicUsize,
    fetches_held: AtomicBool,
    fetches_released: Notify,
    fetch_count: AtomicUsize,
    publish_count: AtomicUsize,
    next_watch: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fresh (private, public) locator pair at edition 0.
    pub fn generate_identity(site: &str) -> (Locator, Locator) {
        let insert_key = Uuid::new_v4().simple().to_string();
        let request_key = derive_request_key(&insert_key);
        (
            Locator::new(KeyType::Usk, insert_key, site, 0),
            Locator::new(KeyType::Usk, request_key, site, 0),
        )
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While offline every fetch and publish fails with
    /// [`TransportError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Park every fetch (after it has been counted) until
    /// [`release_fetches`](Self::release_fetches) is called.
    pub fn hold_fetches(&self) {
        self.fetches_held.store(true, Ordering::SeqCst);
    }

    pub fn release_fetches(&self) {
        self.fetches_held.store(false, Ordering::SeqCst);
        self.fetches_released.notify_waiters();
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn publish_count(&self) -> usize {
        self.publish_count.load(Ordering::SeqCst)
    }

    /// Number of live watch registrations.
    pub fn watch_count(&self) -> usize {
        self.state().watchers.values().map(Vec::len).sum()
    }

    /// Latest published edition for a public locator.
    pub fn latest_edition(&self, request: &Locator) -> Option<u64> {
        let key = (request.keypair().to_string(), request.site().to_string());
        self.state()
            .sites
            .get(&key)
            .and_then(|editions| editions.keys().next_back().copied())
    }

    async fn wait_for_fetch_gate(&self) {
        loop {
            let released = self.fetches_released.notified();
            if !self.fetches_held.load(Ordering::SeqCst) {
                return;
            }
            released.await;
        }
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(TransportError::Unavailable("simulated network is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FetchCapability for MemoryNetwork {
    async fn fetch(&self, locator: &Locator) -> Result<Option<FetchResult>, TransportError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.wait_for_fetch_gate().await;
        self.check_online()?;

        let key = (locator.keypair().to_string(), locator.site().to_string());
        let state = self.state();
        let Some((&number, edition)) = state
            .sites
            .get(&key)
            .and_then(|editions| editions.range(locator.suggested_edition()..).next_back())
        else {
            return Ok(None);
        };
        let name = locator.resource().unwrap_or(edition.default_entry.as_str());
        let Some(entry) = edition.entries.get(name) else {
            return Ok(None);
        };
        Ok(state.blobs.get(&entry.hash).map(|data| FetchResult {
            data: data.clone(),
            content_type: entry.content_type.clone(),
            edition: number,
        }))
    }
}

#[async_trait]
impl PublishCapability for MemoryNetwork {
    async fn publish(
        &self,
        locator: &Locator,
        manifest: Manifest,
        default_entry: &str,
    ) -> Result<Locator, TransportError> {
        self.check_online()?;
        let rejected = self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(TransportError::Rejected("injected publish failure".into()));
        }
        if !manifest.contains_key(default_entry) {
            log::debug!("Manifest for {} has no {} entry", locator, default_entry);
        }

        let request_key = derive_request_key(locator.keypair());
        let key = (request_key, locator.site().to_string());
        let (edition, callbacks) = {
            let mut state = self.state();
            let mut entries = BTreeMap::new();
            for (name, entry) in manifest {
                let hash = content_hash(&entry.data);
                state.blobs.entry(hash.clone()).or_insert(entry.data);
                entries.insert(
                    name,
                    StoredEntry {
                        hash,
                        content_type: entry.content_type,
                    },
                );
            }

            let editions = state.sites.entry(key.clone()).or_default();
            let edition = match editions.keys().next_back() {
                Some(last) => locator.suggested_edition().max(last + 1),
                None => locator.suggested_edition(),
            };
            editions.insert(
                edition,
                PublishedEdition {
                    entries,
                    default_entry: default_entry.to_string(),
                },
            );
            let callbacks: Vec<UpdateCallback> = state
                .watchers
                .get(&key)
                .map(|watches| watches.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default();
            (edition, callbacks)
        };
        self.publish_count.fetch_add(1, Ordering::SeqCst);
        log::debug!("Published {}/{} at edition {}", key.0, key.1, edition);

        for callback in callbacks {
            callback(edition);
        }
        Ok(Locator::new(
            locator.key_type(),
            locator.keypair(),
            locator.site(),
            edition,
        ))
    }
}

impl UpdateWatcher for MemoryNetwork {
    fn register_watch(&self, locator: &Locator, on_update: UpdateCallback) -> WatchId {
        let key = (locator.keypair().to_string(), locator.site().to_string());
        let watch = WatchId(self.next_watch.fetch_add(1, Ordering::SeqCst));
        self.state()
            .watchers
            .entry(key)
            .or_default()
            .push((watch, on_update));
        watch
    }

    fn unregister_watch(&self, locator: &Locator, watch: WatchId) {
        let key = (locator.keypair().to_string(), locator.site().to_string());
        let mut state = self.state();
        if let Some(watches) = state.watchers.get_mut(&key) {
            watches.retain(|(id, _)| *id != watch);
            if watches.is_empty() {
                state.watchers.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::transport::ManifestEntry;

    fn manifest(text: &str) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.insert("doc".into(), ManifestEntry::new(text.as_bytes().to_vec(), "text/plain"));
        manifest
    }

    #[tokio::test]
    async fn test_publish_then_fetch_latest() {
        let network = MemoryNetwork::new();
        let (insert, request) = MemoryNetwork::generate_identity("Sone");

        let first = network.publish(&insert, manifest("one"), "doc").await.unwrap();
        let second = network.publish(&insert, manifest("two"), "doc").await.unwrap();
        assert_eq!(first.edition(), 0);
        assert_eq!(second.edition(), 1);
        assert_eq!(second.keypair(), insert.keypair());
        assert_eq!(network.latest_edition(&request), Some(1));

        let fetched = network.fetch(&request).await.unwrap().unwrap();
        assert_eq!(fetched.data, b"two");
        assert_eq!(fetched.content_type, "text/plain");
        assert_eq!(fetched.edition, 1);

        let by_name = network
            .fetch(&request.with_resource("doc"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_name.data, b"two");
    }

    #[tokio::test]
    async fn test_fetch_missing() {
        let network = MemoryNetwork::new();
        let (insert, request) = MemoryNetwork::generate_identity("Sone");
        assert_eq!(network.fetch(&request).await.unwrap(), None);

        network.publish(&insert, manifest("one"), "doc").await.unwrap();
        assert_eq!(
            network.fetch(&request.with_resource("other")).await.unwrap(),
            None
        );
        assert_eq!(
            network
                .fetch(&request.with_suggested_edition(5))
                .await
                .unwrap(),
            None
        );
        // Private keys do not address anything readable.
        assert_eq!(network.fetch(&insert).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_edition_hint_is_respected() {
        let network = MemoryNetwork::new();
        let (insert, _) = MemoryNetwork::generate_identity("Sone");
        let published = network
            .publish(&insert.with_suggested_edition(7), manifest("x"), "doc")
            .await
            .unwrap();
        assert_eq!(published.edition(), 7);
        let next = network
            .publish(&insert.with_suggested_edition(0), manifest("y"), "doc")
            .await
            .unwrap();
        assert_eq!(next.edition(), 8);
    }

    #[tokio::test]
    async fn test_watchers_notified_with_edition() {
        let network = MemoryNetwork::new();
        let (insert, request) = MemoryNetwork::generate_identity("Sone");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let watch =
            network.register_watch(&request, Arc::new(move |e: u64| sink.lock().unwrap().push(e)));
        assert_eq!(network.watch_count(), 1);

        network.publish(&insert, manifest("a"), "doc").await.unwrap();
        network.publish(&insert, manifest("b"), "doc").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);

        network.unregister_watch(&request, watch);
        network.publish(&insert, manifest("c"), "doc").await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(network.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_keeps_other_watchers() {
        let network = MemoryNetwork::new();
        let (insert, request) = MemoryNetwork::generate_identity("Sone");
        let first_seen = Arc::new(AtomicUsize::new(0));
        let second_seen = Arc::new(AtomicUsize::new(0));
        let first = {
            let seen = Arc::clone(&first_seen);
            network.register_watch(
                &request,
                Arc::new(move |_: u64| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        {
            let seen = Arc::clone(&second_seen);
            network.register_watch(
                &request,
                Arc::new(move |_: u64| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(network.watch_count(), 2);

        network.unregister_watch(&request, first);
        assert_eq!(network.watch_count(), 1);
        // Unknown or already removed registrations are ignored.
        network.unregister_watch(&request, first);
        assert_eq!(network.watch_count(), 1);

        network.publish(&insert, manifest("a"), "doc").await.unwrap();
        assert_eq!(first_seen.load(Ordering::SeqCst), 0);
        assert_eq!(second_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let network = MemoryNetwork::new();
        let (insert, request) = MemoryNetwork::generate_identity("Sone");

        network.fail_next_publishes(1);
        assert!(matches!(
            network.publish(&insert, manifest("a"), "doc").await,
            Err(TransportError::Rejected(_))
        ));
        assert!(network.publish(&insert, manifest("a"), "doc").await.is_ok());
        assert_eq!(network.publish_count(), 1);

        network.set_offline(true);
        assert_eq!(
            network.fetch(&request).await,
            Err(TransportError::Unavailable("simulated network is offline".into()))
        );
    }

    #[test]
    fn test_content_addressing() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"").len(), 64);
        assert_ne!(derive_request_key("k"), "k");
    }
}
