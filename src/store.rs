//! Process-wide document registry
//!
//! Maps document IDs to shared [`Document`]s plus a parallel status map.
//! Documents are created on first reference and never removed here.
//!
//! The status doubles as a per-document lock token: [`DocumentStore::begin`]
//! atomically claims a fetch or publish slot and hands back a
//! [`StatusGuard`] that settles the status again when dropped, whatever path
//! the caller leaves by.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use crate::data::{Document, KnownDocument, Post};

/// Per-document synchronization status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    /// Never successfully fetched.
    Unknown,
    /// A fetch is in flight.
    Fetching,
    /// Known and quiet.
    Idle,
    /// A publish is in flight.
    Publishing,
}

impl DocumentStatus {
    /// True while a fetch or publish is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, DocumentStatus::Fetching | DocumentStatus::Publishing)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Unknown => "unknown",
            DocumentStatus::Fetching => "fetching",
            DocumentStatus::Idle => "idle",
            DocumentStatus::Publishing => "publishing",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
pub struct DocumentStore {
    documents: RwLock<HashMap<Uuid, Arc<Document>>>,
    statuses: RwLock<HashMap<Uuid, DocumentStatus>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a document, creating an empty placeholder with unknown status
    /// if the ID has not been seen yet.
    pub fn get_or_create(&self, id: Uuid) -> Arc<Document> {
        if let Some(doc) = self.get(&id) {
            return doc;
        }
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        let doc = documents
            .entry(id)
            .or_insert_with(|| {
                log::debug!("Creating placeholder document {}", id);
                Arc::new(Document::new(id))
            })
            .clone();
        drop(documents);
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert(DocumentStatus::Unknown);
        doc
    }

    /// Register an already built document. An existing entry with the same
    /// ID wins and is returned instead.
    pub fn insert(&self, document: Document) -> Arc<Document> {
        let id = document.id();
        let status = if document.time() == 0 {
            DocumentStatus::Unknown
        } else {
            DocumentStatus::Idle
        };
        let doc = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| Arc::new(document))
            .clone();
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert(status);
        doc
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Document>> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.documents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn documents(&self) -> Vec<Arc<Document>> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn status(&self, id: &Uuid) -> DocumentStatus {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(DocumentStatus::Unknown)
    }

    pub fn set_status(&self, id: Uuid, status: DocumentStatus) {
        log::trace!("Status of {} is now {}", id, status);
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, status);
    }

    /// Claim `status` (fetching or publishing) for a document.
    ///
    /// Returns `None` while another fetch or publish holds the document; the
    /// check and the transition happen under one lock.
    pub fn begin(&self, id: Uuid, status: DocumentStatus) -> Option<StatusGuard<'_>> {
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
        let current = statuses.entry(id).or_insert(DocumentStatus::Unknown);
        if current.is_busy() {
            return None;
        }
        *current = status;
        Some(StatusGuard {
            store: self,
            id,
            status,
        })
    }

    /// Resolve a document's friend IDs, ordered by display name
    /// (case-insensitive) and then by most recent update.
    pub fn friends_of(&self, id: &Uuid) -> Vec<Arc<Document>> {
        let Some(doc) = self.get(id) else {
            return Vec::new();
        };
        let mut friends: Vec<(String, u64, Arc<Document>)> = doc
            .friend_ids()
            .into_iter()
            .filter_map(|friend| self.get(&friend))
            .map(|friend| {
                let name = friend.name().unwrap_or_default().to_lowercase();
                (name, friend.time(), friend)
            })
            .collect();
        friends.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
        friends.into_iter().map(|(_, _, doc)| doc).collect()
    }

    /// Every document worth advertising to peers of `id`: those with a
    /// public locator and a name, minus `id` itself and its blocked set.
    pub fn known_documents_for(&self, id: &Uuid) -> Vec<KnownDocument> {
        let blocked = self.get(id).map(|d| d.blocked_ids()).unwrap_or_default();
        let mut known: Vec<KnownDocument> = self
            .documents()
            .into_iter()
            .filter(|doc| doc.id() != *id && !blocked.contains(&doc.id()))
            .filter_map(|doc| {
                Some(KnownDocument {
                    id: doc.id(),
                    locator: doc.request_locator()?,
                    name: doc.name()?,
                })
            })
            .collect();
        known.sort_by_key(|k| k.id);
        known
    }

    /// Find a post by ID across all documents.
    pub fn find_post(&self, post_id: &Uuid) -> Option<Post> {
        self.documents()
            .into_iter()
            .find_map(|doc| doc.post(post_id))
    }

    fn settle(&self, id: Uuid, claimed: DocumentStatus) {
        let settled = match claimed {
            DocumentStatus::Fetching => {
                let known = self.get(&id).map_or(false, |doc| doc.time() != 0);
                if known {
                    DocumentStatus::Idle
                } else {
                    DocumentStatus::Unknown
                }
            }
            _ => DocumentStatus::Idle,
        };
        self.set_status(id, settled);
    }
}

/// Holds a claimed fetch or publish slot; settles the status on drop.
pub struct StatusGuard<'a> {
    store: &'a DocumentStore,
    id: Uuid,
    status: DocumentStatus,
}

impl StatusGuard<'_> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        self.store.settle(self.id, self.status);
    }
}
