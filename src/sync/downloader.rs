//! Downloader
//!
//! Watches remote documents, fetches new versions when the network announces
//! them, validates them and merges them into the [`DocumentStore`]. Known
//! documents advertised inside a fetched version are registered and watched
//! in turn, which is how the set of followed documents grows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::transport::{FetchCapability, UpdateCallback, UpdateWatcher, WatchId};
use super::wire::decode_document;
use super::{SyncError, ValidationError};
use crate::config::DownloaderConfig;
use crate::data::{Document, Locator};
use crate::store::{DocumentStatus, DocumentStore};

/// Result of a successful [`merge_document`].
#[derive(Debug)]
pub struct ParsedDocument {
    /// The document the version was merged into.
    pub document: Arc<Document>,
    /// Remote documents advertised by the version, ready to be watched.
    pub discovered: Vec<Arc<Document>>,
}

/// What a call to [`Downloader::on_update_available`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Another fetch or publish of the document was already in flight.
    Busy,
    /// The network had nothing at the requested edition.
    NotFound,
    /// A new version was merged; `discovered` lists newly watched documents,
    /// each of which has a first fetch queued.
    Updated { discovered: Vec<Uuid> },
}

/// An update announced by the watch mechanism.
#[derive(Debug, Clone, Copy)]
struct UpdateNotice {
    id: Uuid,
    edition: u64,
}

/// Validate `bytes` and merge them into the store.
///
/// With `existing` set, the payload must declare that document's ID and is
/// merged into it; otherwise the target is looked up (or created) by the
/// declared ID. Validation completes before anything is written, so on error
/// the target keeps its previous state.
pub fn merge_document(
    store: &DocumentStore,
    bytes: &[u8],
    existing: Option<&Arc<Document>>,
) -> Result<ParsedDocument, ValidationError> {
    let decoded = decode_document(bytes, existing.map(|d| d.id()))?;
    let document = match existing {
        Some(doc) => Arc::clone(doc),
        None => store.get_or_create(decoded.id),
    };
    let id = document.id();
    for section in &decoded.missing_sections {
        log::warn!("Document {} has no {} section", id, section);
    }

    let (update, known_documents) = decoded.into_parts();
    document
        .apply_remote(update)
        .map_err(|conflict| ValidationError::LocatorMismatch {
            field: "request-uri",
            existing: conflict.existing,
            incoming: conflict.incoming,
        })?;

    let mut discovered = Vec::with_capacity(known_documents.len());
    for known in known_documents {
        if known.id == id {
            continue;
        }
        let peer = store.get_or_create(known.id);
        if peer.is_local() {
            continue;
        }
        if let Err(conflict) = peer.set_request_locator(known.locator) {
            log::warn!("Ignoring locator advertised by {} for {}: {}", id, known.id, conflict);
        }
        if peer.time() == 0 {
            peer.set_name(known.name);
        }
        discovered.push(peer);
    }

    log::debug!(
        "Merged {} at time {} ({} known documents)",
        document,
        document.time(),
        discovered.len()
    );
    Ok(ParsedDocument {
        document,
        discovered,
    })
}

pub struct Downloader {
    store: Arc<DocumentStore>,
    fetcher: Arc<dyn FetchCapability>,
    watcher: Arc<dyn UpdateWatcher>,
    config: DownloaderConfig,
    watched: Mutex<HashMap<Uuid, (Locator, WatchId)>>,
    notice_tx: mpsc::UnboundedSender<UpdateNotice>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<UpdateNotice>>>,
    fetch_slots: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Downloader {
    pub fn new(
        store: Arc<DocumentStore>,
        fetcher: Arc<dyn FetchCapability>,
        watcher: Arc<dyn UpdateWatcher>,
        config: DownloaderConfig,
    ) -> Arc<Self> {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let fetch_slots = Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1)));

        Arc::new(Self {
            store,
            fetcher,
            watcher,
            config,
            watched: Mutex::new(HashMap::new()),
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
            fetch_slots,
            shutdown_tx,
            worker: Mutex::new(None),
        })
    }

    fn watched(&self) -> MutexGuard<'_, HashMap<Uuid, (Locator, WatchId)>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Start the worker that turns update notices into fetches. Calling this
    /// more than once has no effect.
    pub fn start(self: &Arc<Self>) {
        let Some(mut rx) = self
            .notice_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            log::debug!("Downloader already started");
            return;
        };
        let downloader = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    Some(notice) = rx.recv() => {
                        let Some(document) = downloader.store.get(&notice.id) else {
                            continue;
                        };
                        document.suggest_edition(notice.edition);
                        let slots = Arc::clone(&downloader.fetch_slots);
                        let permit = tokio::select! {
                            biased;
                            _ = shutdown.recv() => break,
                            permit = slots.acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => break,
                            },
                        };
                        let downloader = Arc::clone(&downloader);
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = downloader.on_update_available(&document).await {
                                log::warn!("Fetching {} failed: {}", document.id(), e);
                            }
                        });
                    }
                }
            }
            log::debug!("Downloader worker stopped");
        });
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
    }

    /// True between [`start`](Self::start) and the worker exiting after
    /// [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Begin receiving update notifications for `document`.
    ///
    /// Returns false if the document is already watched, is locally owned or
    /// has no public locator yet.
    pub fn watch(&self, document: &Document) -> bool {
        let id = document.id();
        if document.is_local() {
            return false;
        }
        let Some(locator) = document.request_locator() else {
            log::debug!("Not watching {}: no public locator", id);
            return false;
        };

        let mut watched = self.watched();
        if watched.contains_key(&id) {
            return false;
        }
        let tx = self.notice_tx.clone();
        let on_update: UpdateCallback = Arc::new(move |edition: u64| {
            let _ = tx.send(UpdateNotice { id, edition });
        });
        let watch = self.watcher.register_watch(&locator, on_update);
        watched.insert(id, (locator, watch));
        log::debug!("Watching {}", id);
        true
    }

    /// Stop receiving notifications for `document`. Returns false if it was
    /// not watched.
    pub fn unwatch(&self, document: &Document) -> bool {
        match self.watched().remove(&document.id()) {
            Some((locator, watch)) => {
                self.watcher.unregister_watch(&locator, watch);
                log::debug!("No longer watching {}", document.id());
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, id: &Uuid) -> bool {
        self.watched().contains_key(id)
    }

    pub fn watched_count(&self) -> usize {
        self.watched().len()
    }

    /// Queue a fetch of `id` at its currently suggested edition, as if the
    /// network had just announced it.
    pub fn request_update(&self, id: Uuid) {
        let edition = self
            .store
            .get(&id)
            .and_then(|doc| doc.request_locator())
            .map_or(0, |locator| locator.suggested_edition());
        let _ = self.notice_tx.send(UpdateNotice { id, edition });
    }

    /// Fetch and merge the version of `document` its public locator points
    /// at.
    ///
    /// Only one fetch per document runs at a time; a call that finds the
    /// document busy returns [`FetchOutcome::Busy`] straight away. The
    /// document's status is settled again on every exit path.
    pub async fn on_update_available(
        &self,
        document: &Arc<Document>,
    ) -> Result<FetchOutcome, SyncError> {
        let id = document.id();
        let Some(_guard) = self.store.begin(id, DocumentStatus::Fetching) else {
            log::debug!("Fetch of {} already in flight", id);
            return Ok(FetchOutcome::Busy);
        };

        let locator = document
            .request_locator()
            .ok_or(SyncError::NoLocator(id))?
            .with_resource(&self.config.resource_name);
        log::debug!("Fetching {} from {}", id, locator);

        let fetched = match self.fetcher.fetch(&locator).await? {
            Some(fetched) => fetched,
            None => {
                log::info!("Nothing found for {} at {}", id, locator);
                return Ok(FetchOutcome::NotFound);
            }
        };

        let parsed = self.parse(&fetched.data, Some(document)).map_err(|e| {
            log::warn!("Refusing version of {} from {}: {}", id, locator, e);
            e
        })?;
        document.advance_editions(fetched.edition);

        // Newly discovered documents may have published long ago; fetch them
        // now instead of waiting for their next edition.
        let discovered: Vec<Uuid> = parsed
            .discovered
            .iter()
            .filter(|peer| self.watch(peer))
            .map(|peer| peer.id())
            .collect();
        for peer in &discovered {
            self.request_update(*peer);
        }
        log::info!(
            "Updated {} to edition {} ({} newly discovered)",
            id,
            fetched.edition,
            discovered.len()
        );
        Ok(FetchOutcome::Updated { discovered })
    }

    /// Validate and merge a raw payload. See [`merge_document`].
    pub fn parse(
        &self,
        bytes: &[u8],
        existing: Option<&Arc<Document>>,
    ) -> Result<ParsedDocument, ValidationError> {
        merge_document(&self.store, bytes, existing)
    }

    /// Unwatch everything and stop the worker.
    pub fn stop(&self) {
        let watched: Vec<(Locator, WatchId)> = self.watched().drain().map(|(_, w)| w).collect();
        for (locator, watch) in &watched {
            self.watcher.unregister_watch(locator, *watch);
        }
        let _ = self.shutdown_tx.send(());
        log::debug!("Downloader stopped, {} watches released", watched.len());
    }
}
