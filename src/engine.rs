//! Sync engine
//!
//! Owns the document store and the downloader and runs one inserter per
//! local document. This is the entry point an application embeds.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::data::{Document, Locator};
use crate::store::DocumentStore;
use crate::sync::{
    Downloader, FetchCapability, Inserter, InserterHandle, PublishCapability, SyncError,
    UpdateWatcher, ValidationError,
};

pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<DocumentStore>,
    downloader: Arc<Downloader>,
    publisher: Arc<dyn PublishCapability>,
    inserters: Mutex<HashMap<Uuid, InserterHandle>>,
}

impl SyncEngine {
    /// Create the engine and start its downloader. Must be called from
    /// within a tokio runtime.
    pub fn start(
        config: SyncConfig,
        fetcher: Arc<dyn FetchCapability>,
        publisher: Arc<dyn PublishCapability>,
        watcher: Arc<dyn UpdateWatcher>,
    ) -> Self {
        let store = Arc::new(DocumentStore::new());
        let downloader = Downloader::new(
            Arc::clone(&store),
            fetcher,
            watcher,
            config.downloader.clone(),
        );
        downloader.start();
        log::info!(
            "Sync engine started (debounce {:?})",
            config.inserter.debounce()
        );

        Self {
            config,
            store,
            downloader,
            publisher,
            inserters: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    /// Register a locally owned document and start publishing it.
    ///
    /// If the store already holds a document with the same ID, that one is
    /// kept and returned.
    pub async fn add_local(&self, document: Document) -> Result<Arc<Document>, SyncError> {
        if !document.is_local() {
            return Err(SyncError::NotLocal(document.id()));
        }
        let document = self.store.insert(document);
        let id = document.id();

        let mut inserters = self.inserters.lock().await;
        if !inserters.contains_key(&id) {
            let inserter = Inserter::new(
                Arc::clone(&document),
                Arc::clone(&self.store),
                Arc::clone(&self.publisher),
                &self.config,
            );
            inserters.insert(id, inserter.start());
            log::info!("Publishing local document {}", document);
        }
        Ok(document)
    }

    /// Stop publishing a local document. Waits for a publish in progress.
    pub async fn remove_local(&self, id: &Uuid) -> bool {
        let handle = self.inserters.lock().await.remove(id);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn local_ids(&self) -> Vec<Uuid> {
        self.inserters.lock().await.keys().copied().collect()
    }

    /// Start following a remote document and queue a first fetch.
    pub fn follow(&self, id: Uuid, locator: Locator) -> Result<Arc<Document>, SyncError> {
        let document = self.store.get_or_create(id);
        document
            .set_request_locator(locator)
            .map_err(|conflict| ValidationError::LocatorMismatch {
                field: "request-uri",
                existing: conflict.existing,
                incoming: conflict.incoming,
            })?;
        if self.downloader.watch(&document) {
            self.downloader.request_update(id);
        }
        Ok(document)
    }

    pub fn unfollow(&self, id: &Uuid) -> bool {
        self.store
            .get(id)
            .map_or(false, |document| self.downloader.unwatch(&document))
    }

    /// Stop every inserter (finishing in-flight publishes) and the downloader.
    pub async fn shutdown(&self) {
        let handles: Vec<InserterHandle> = self
            .inserters
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.stop().await;
        }
        self.downloader.stop();
        log::info!("Sync engine stopped");
    }
}
