//! Inserter
//!
//! One inserter runs per locally owned document. On every tick it compares
//! the document's modification counter with the last value it saw; a higher
//! value starts (or restarts) the debounce period and stamps the document's
//! update time. Once the document has been quiet for the whole debounce
//! period, a snapshot is published and both locators advance to the edition
//! the network chose.
//!
//! A failed publish leaves the document pending and is retried after an
//! exponentially growing delay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::transport::PublishCapability;
use super::wire::{build_manifest, LANDING_PAGE};
use super::SyncError;
use crate::config::{InserterConfig, SyncConfig};
use crate::data::{now_millis, Document, DocumentSnapshot, KeyType, KnownDocument, Locator};
use crate::store::{DocumentStatus, DocumentStore};

/// What one [`Inserter::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to publish.
    Idle,
    /// A modification is waiting for the debounce period or a retry.
    Pending,
    /// A snapshot was published at this edition.
    Published { edition: u64 },
    /// The publish attempt failed and will be retried.
    Failed,
}

/// Debounce and retry bookkeeping, driven by explicit instants.
#[derive(Debug, Clone)]
pub struct DebounceState {
    debounce: Duration,
    retry_initial: Duration,
    retry_max: Duration,
    last_counter: u64,
    last_modified: Option<Instant>,
    retry_delay: Duration,
    retry_at: Option<Instant>,
}

impl DebounceState {
    pub fn new(config: &InserterConfig) -> Self {
        Self {
            debounce: config.debounce(),
            retry_initial: config.retry_initial(),
            retry_max: config.retry_max(),
            last_counter: 0,
            last_modified: None,
            retry_delay: config.retry_initial(),
            retry_at: None,
        }
    }

    /// Feed the current modification counter. Returns true when it shows a
    /// modification not seen before, which restarts the debounce period.
    pub fn observe(&mut self, counter: u64, now: Instant) -> bool {
        if counter > self.last_counter {
            self.last_counter = counter;
            self.last_modified = Some(now);
            true
        } else {
            if counter < self.last_counter {
                // Reset elsewhere; follow it so later edits are still seen.
                self.last_counter = counter;
            }
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.last_modified.is_some()
    }

    /// True once the document has been quiet for the debounce period and any
    /// retry delay has passed.
    pub fn due(&self, now: Instant) -> bool {
        let Some(modified) = self.last_modified else {
            return false;
        };
        now.saturating_duration_since(modified) >= self.debounce
            && self.retry_at.map_or(true, |at| now >= at)
    }

    /// Record a successful publish. With `quiescent` set the document saw no
    /// modification while publishing and the state returns to idle.
    pub fn published(&mut self, quiescent: bool) {
        self.retry_at = None;
        self.retry_delay = self.retry_initial;
        if quiescent {
            self.last_counter = 0;
            self.last_modified = None;
        }
    }

    /// Record a failed publish and return the delay before the next attempt.
    pub fn failed(&mut self, now: Instant) -> Duration {
        let delay = self.retry_delay;
        self.retry_at = Some(now + delay);
        self.retry_delay = (delay * 2).min(self.retry_max);
        delay
    }
}

pub struct Inserter {
    document: Arc<Document>,
    store: Arc<DocumentStore>,
    publisher: Arc<dyn PublishCapability>,
    config: InserterConfig,
    resource_name: String,
    state: DebounceState,
}

impl Inserter {
    pub fn new(
        document: Arc<Document>,
        store: Arc<DocumentStore>,
        publisher: Arc<dyn PublishCapability>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            document,
            store,
            publisher,
            state: DebounceState::new(&config.inserter),
            config: config.inserter.clone(),
            resource_name: config.downloader.resource_name.clone(),
        }
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn state(&self) -> &DebounceState {
        &self.state
    }

    /// Run one iteration of the publish loop as of `now`.
    pub async fn tick(&mut self, now: Instant) -> TickOutcome {
        let counter = self.document.modification_counter();
        if self.state.observe(counter, now) {
            self.document.set_time(now_millis());
            log::debug!("{} modified (counter {})", self.document, counter);
        }

        if !self.state.due(now) {
            return if self.state.is_pending() {
                TickOutcome::Pending
            } else {
                TickOutcome::Idle
            };
        }
        self.publish(now).await
    }

    async fn publish(&mut self, now: Instant) -> TickOutcome {
        let id = self.document.id();
        let store = Arc::clone(&self.store);
        let Some(_guard) = store.begin(id, DocumentStatus::Publishing) else {
            log::debug!("{} is busy, postponing publish", id);
            return TickOutcome::Pending;
        };

        let snapshot = self.document.snapshot();
        let known = store.known_documents_for(&id);
        match self.publish_snapshot(&snapshot, &known).await {
            Ok(published) => {
                let edition = published.edition();
                self.document.advance_editions(edition);
                let quiescent = self
                    .document
                    .reset_modification_counter_if(snapshot.modification_counter);
                self.state.published(quiescent);
                log::info!(
                    "Published {} at edition {}{}",
                    self.document,
                    edition,
                    if quiescent { "" } else { " (modified meanwhile)" }
                );
                TickOutcome::Published { edition }
            }
            Err(e) => {
                let delay = self.state.failed(now);
                log::warn!("Publishing {} failed, retrying in {:?}: {}", id, delay, e);
                TickOutcome::Failed
            }
        }
    }

    async fn publish_snapshot(
        &self,
        snapshot: &DocumentSnapshot,
        known: &[KnownDocument],
    ) -> Result<Locator, SyncError> {
        let insert = snapshot
            .insert_locator
            .as_ref()
            .ok_or(SyncError::NotLocal(snapshot.id))?;
        let manifest = build_manifest(snapshot, known, &self.resource_name)?;
        let target = insert.with_key_type(KeyType::Usk).with_suggested_edition(0);
        log::debug!("Inserting {} ({} known documents)", snapshot.id, known.len());
        Ok(self.publisher.publish(&target, manifest, LANDING_PAGE).await?)
    }

    /// Spawn the publish loop. The stop signal is checked between ticks, so
    /// a publish that has started always runs to completion.
    pub fn start(mut self) -> InserterHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let id = self.document.id();
        let period = self.config.tick_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {}
                }
                self.tick(Instant::now()).await;
            }
            log::debug!("Inserter for {} stopped", self.document.id());
        });

        InserterHandle {
            id,
            shutdown_tx,
            task,
        }
    }
}

/// Handle to a running inserter loop.
pub struct InserterHandle {
    id: Uuid,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl InserterHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop the loop and wait for it, including any publish in progress.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            log::error!("Inserter for {} ended abnormally: {}", self.id, e);
        }
    }
}
