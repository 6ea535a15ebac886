//! Identity documents
//!
//! A [`Document`] is one user's replicated social record. Local documents
//! carry a private (insert) locator and are published by an inserter; remote
//! documents only carry the public (request) locator and are filled in by the
//! downloader.
//!
//! All fields sit behind one lock so that a merge of profile, posts, replies
//! and likes is observed as a single step. Every semantic mutation bumps the
//! modification counter, which the inserter uses as its dirty flag.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use super::locator::{Locator, LocatorConflict};
use super::post::{Post, Reply};
use super::profile::Profile;

/// A peer-advertised reference to another document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownDocument {
    pub id: Uuid,
    pub locator: Locator,
    pub name: String,
}

#[derive(Default)]
struct DocumentFields {
    name: Option<String>,
    time: u64,
    request_locator: Option<Locator>,
    insert_locator: Option<Locator>,
    profile: Profile,
    posts: HashMap<Uuid, Post>,
    replies: HashMap<Uuid, Reply>,
    blocked_ids: HashSet<Uuid>,
    liked_post_ids: HashSet<Uuid>,
    liked_reply_ids: HashSet<Uuid>,
    friend_ids: HashSet<Uuid>,
    modification_counter: u64,
}

impl DocumentFields {
    fn touch(&mut self) {
        self.modification_counter += 1;
    }

    /// Bring both locators up to the highest edition either one knows.
    fn align_editions(&mut self) {
        let request = self.request_locator.as_ref().map_or(0, Locator::edition);
        let insert = self.insert_locator.as_ref().map_or(0, Locator::edition);
        self.advance_editions(request.max(insert));
    }

    fn advance_editions(&mut self, edition: u64) {
        for locator in [&mut self.request_locator, &mut self.insert_locator]
            .into_iter()
            .flatten()
        {
            if locator.edition() < edition {
                locator.advance_to(edition);
            }
        }
    }
}

/// Everything a remote version replaces, validated before it is applied.
#[derive(Clone, Debug, Default)]
pub struct RemoteUpdate {
    pub name: String,
    pub time: u64,
    pub request_locator: Option<Locator>,
    pub insert_locator: Option<Locator>,
    pub profile: Profile,
    pub posts: Vec<Post>,
    pub replies: Vec<Reply>,
    pub liked_post_ids: HashSet<Uuid>,
    pub liked_reply_ids: HashSet<Uuid>,
}

/// A fully copied, immutable view of a document, taken for publishing.
#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    pub id: Uuid,
    pub name: Option<String>,
    pub time: u64,
    pub request_locator: Option<Locator>,
    pub insert_locator: Option<Locator>,
    pub profile: Profile,
    /// Newest first.
    pub posts: Vec<Post>,
    /// Oldest first.
    pub replies: Vec<Reply>,
    pub blocked_ids: BTreeSet<Uuid>,
    pub liked_post_ids: BTreeSet<Uuid>,
    pub liked_reply_ids: BTreeSet<Uuid>,
    pub modification_counter: u64,
}

pub struct Document {
    id: Uuid,
    fields: RwLock<DocumentFields>,
}

impl Document {
    /// An empty placeholder for the given ID.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            fields: RwLock::new(DocumentFields::default()),
        }
    }

    /// A fresh document with a random ID.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    fn read(&self) -> RwLockReadGuard<'_, DocumentFields> {
        self.fields.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DocumentFields> {
        self.fields.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.read().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.write().name = Some(name.into());
    }

    /// Last-update timestamp in milliseconds; 0 while unknown.
    pub fn time(&self) -> u64 {
        self.read().time
    }

    pub fn set_time(&self, time: u64) {
        self.write().time = time;
    }

    // ------------------------------------------------------------------
    // Locators
    // ------------------------------------------------------------------

    pub fn request_locator(&self) -> Option<Locator> {
        self.read().request_locator.clone()
    }

    pub fn insert_locator(&self) -> Option<Locator> {
        self.read().insert_locator.clone()
    }

    /// Locally owned documents are the ones we hold the private locator for.
    pub fn is_local(&self) -> bool {
        self.read().insert_locator.is_some()
    }

    /// Adopt or reconcile the public locator. A different keypair is refused
    /// and the stored locator stays as it was.
    pub fn set_request_locator(&self, locator: Locator) -> Result<(), LocatorConflict> {
        let mut fields = self.write();
        match fields.request_locator.as_mut() {
            Some(existing) => existing.reconcile(&locator),
            None => {
                fields.request_locator = Some(locator.without_resource());
                fields.align_editions();
                Ok(())
            }
        }
    }

    /// Adopt or reconcile the private locator.
    pub fn set_insert_locator(&self, locator: Locator) -> Result<(), LocatorConflict> {
        let mut fields = self.write();
        match fields.insert_locator.as_mut() {
            Some(existing) => existing.reconcile(&locator),
            None => {
                fields.insert_locator = Some(locator.without_resource());
                fields.align_editions();
                Ok(())
            }
        }
    }

    /// Raise the fetch hint after the network announced a new edition.
    pub fn suggest_edition(&self, edition: u64) {
        if let Some(locator) = self.write().request_locator.as_mut() {
            locator.suggest(edition);
        }
    }

    /// Record an edition known to exist (published or fetched) on both
    /// locators.
    pub fn advance_editions(&self, edition: u64) {
        self.write().advance_editions(edition);
    }

    // ------------------------------------------------------------------
    // Profile
    // ------------------------------------------------------------------

    pub fn profile(&self) -> Profile {
        self.read().profile.clone()
    }

    pub fn set_profile(&self, profile: Profile) {
        let mut fields = self.write();
        fields.profile = profile;
        fields.touch();
    }

    // ------------------------------------------------------------------
    // Posts and replies
    // ------------------------------------------------------------------

    /// All posts, newest first.
    pub fn posts(&self) -> Vec<Post> {
        let mut posts: Vec<Post> = self.read().posts.values().cloned().collect();
        posts.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.id.cmp(&b.id)));
        posts
    }

    pub fn post(&self, id: &Uuid) -> Option<Post> {
        self.read().posts.get(id).cloned()
    }

    pub fn set_posts(&self, posts: impl IntoIterator<Item = Post>) {
        let mut fields = self.write();
        fields.posts = posts.into_iter().map(|p| (p.id, p)).collect();
        fields.touch();
    }

    /// Add a post authored by this document. Returns false for foreign or
    /// already known posts.
    pub fn add_post(&self, post: Post) -> bool {
        if post.author != self.id {
            return false;
        }
        let mut fields = self.write();
        if fields.posts.contains_key(&post.id) {
            return false;
        }
        log::trace!("Adding post {} to {}", post.id, self.id);
        fields.posts.insert(post.id, post);
        fields.touch();
        true
    }

    pub fn remove_post(&self, id: &Uuid) -> bool {
        let mut fields = self.write();
        if fields.posts.remove(id).is_some() {
            fields.touch();
            true
        } else {
            false
        }
    }

    /// All replies, oldest first.
    pub fn replies(&self) -> Vec<Reply> {
        let mut replies: Vec<Reply> = self.read().replies.values().cloned().collect();
        replies.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
        replies
    }

    pub fn set_replies(&self, replies: impl IntoIterator<Item = Reply>) {
        let mut fields = self.write();
        fields.replies = replies.into_iter().map(|r| (r.id, r)).collect();
        fields.touch();
    }

    pub fn add_reply(&self, reply: Reply) -> bool {
        if reply.author != self.id {
            return false;
        }
        let mut fields = self.write();
        if fields.replies.contains_key(&reply.id) {
            return false;
        }
        fields.replies.insert(reply.id, reply);
        fields.touch();
        true
    }

    pub fn remove_reply(&self, id: &Uuid) -> bool {
        let mut fields = self.write();
        if fields.replies.remove(id).is_some() {
            fields.touch();
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Blocks and likes
    // ------------------------------------------------------------------

    pub fn blocked_ids(&self) -> HashSet<Uuid> {
        self.read().blocked_ids.clone()
    }

    pub fn is_blocked(&self, id: &Uuid) -> bool {
        self.read().blocked_ids.contains(id)
    }

    pub fn add_blocked(&self, id: Uuid) {
        let mut fields = self.write();
        if fields.blocked_ids.insert(id) {
            fields.touch();
        }
    }

    pub fn remove_blocked(&self, id: &Uuid) {
        let mut fields = self.write();
        if fields.blocked_ids.remove(id) {
            fields.touch();
        }
    }

    pub fn liked_post_ids(&self) -> HashSet<Uuid> {
        self.read().liked_post_ids.clone()
    }

    pub fn is_liked_post(&self, id: &Uuid) -> bool {
        self.read().liked_post_ids.contains(id)
    }

    pub fn set_liked_post_ids(&self, ids: impl IntoIterator<Item = Uuid>) {
        let mut fields = self.write();
        fields.liked_post_ids = ids.into_iter().collect();
        fields.touch();
    }

    pub fn add_liked_post(&self, id: Uuid) {
        let mut fields = self.write();
        if fields.liked_post_ids.insert(id) {
            fields.touch();
        }
    }

    pub fn remove_liked_post(&self, id: &Uuid) {
        let mut fields = self.write();
        if fields.liked_post_ids.remove(id) {
            fields.touch();
        }
    }

    pub fn liked_reply_ids(&self) -> HashSet<Uuid> {
        self.read().liked_reply_ids.clone()
    }

    pub fn is_liked_reply(&self, id: &Uuid) -> bool {
        self.read().liked_reply_ids.contains(id)
    }

    pub fn set_liked_reply_ids(&self, ids: impl IntoIterator<Item = Uuid>) {
        let mut fields = self.write();
        fields.liked_reply_ids = ids.into_iter().collect();
        fields.touch();
    }

    pub fn add_liked_reply(&self, id: Uuid) {
        let mut fields = self.write();
        if fields.liked_reply_ids.insert(id) {
            fields.touch();
        }
    }

    pub fn remove_liked_reply(&self, id: &Uuid) {
        let mut fields = self.write();
        if fields.liked_reply_ids.remove(id) {
            fields.touch();
        }
    }

    // ------------------------------------------------------------------
    // Friends (IDs only; resolve through the DocumentStore)
    // ------------------------------------------------------------------

    pub fn friend_ids(&self) -> HashSet<Uuid> {
        self.read().friend_ids.clone()
    }

    pub fn has_friend(&self, id: &Uuid) -> bool {
        self.read().friend_ids.contains(id)
    }

    pub fn add_friend(&self, id: Uuid) {
        if id != self.id {
            self.write().friend_ids.insert(id);
        }
    }

    pub fn remove_friend(&self, id: &Uuid) {
        self.write().friend_ids.remove(id);
    }

    // ------------------------------------------------------------------
    // Modification tracking
    // ------------------------------------------------------------------

    pub fn modification_counter(&self) -> u64 {
        self.read().modification_counter
    }

    /// Reset the counter to zero only if it still reads `expected`.
    pub fn reset_modification_counter_if(&self, expected: u64) -> bool {
        let mut fields = self.write();
        if fields.modification_counter == expected {
            fields.modification_counter = 0;
            true
        } else {
            false
        }
    }

    /// Copy every field needed for publishing under one read lock.
    pub fn snapshot(&self) -> DocumentSnapshot {
        let fields = self.read();
        let mut posts: Vec<Post> = fields.posts.values().cloned().collect();
        posts.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.id.cmp(&b.id)));
        let mut replies: Vec<Reply> = fields.replies.values().cloned().collect();
        replies.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));

        DocumentSnapshot {
            id: self.id,
            name: fields.name.clone(),
            time: fields.time,
            request_locator: fields.request_locator.clone(),
            insert_locator: fields.insert_locator.clone(),
            profile: fields.profile.clone(),
            posts,
            replies,
            blocked_ids: fields.blocked_ids.iter().copied().collect(),
            liked_post_ids: fields.liked_post_ids.iter().copied().collect(),
            liked_reply_ids: fields.liked_reply_ids.iter().copied().collect(),
            modification_counter: fields.modification_counter,
        }
    }

    /// Replace this document's content with a validated remote version.
    ///
    /// The public-locator check and every write happen under one write lock:
    /// on conflict nothing is changed, on success readers see the new
    /// profile, posts, replies and likes together. The modification counter
    /// is reset because a freshly merged version is not locally dirty.
    pub fn apply_remote(&self, update: RemoteUpdate) -> Result<(), LocatorConflict> {
        let mut fields = self.write();

        let mut request_locator = fields.request_locator.clone();
        if let Some(incoming) = &update.request_locator {
            match request_locator.as_mut() {
                Some(existing) => existing.reconcile(incoming)?,
                None => request_locator = Some(incoming.without_resource()),
            }
        }

        fields.request_locator = request_locator;
        if fields.insert_locator.is_none() {
            if let Some(insert) = update.insert_locator {
                fields.insert_locator = Some(insert.without_resource());
                fields.align_editions();
            }
        }
        fields.name = Some(update.name);
        fields.time = update.time;
        fields.profile = update.profile;
        fields.posts = update.posts.into_iter().map(|p| (p.id, p)).collect();
        fields.replies = update.replies.into_iter().map(|r| (r.id, r)).collect();
        fields.liked_post_ids = update.liked_post_ids;
        fields.liked_reply_ids = update.liked_reply_ids;
        fields.modification_counter = 0;
        Ok(())
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.read();
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("name", &fields.name)
            .field("request_locator", &fields.request_locator.as_ref().map(|l| l.to_string()))
            .field("posts", &fields.posts.len())
            .field("replies", &fields.replies.len())
            .field("friends", &fields.friend_ids.len())
            .finish()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.read().name.as_deref() {
            Some(name) => write!(f, "“{}” ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}
