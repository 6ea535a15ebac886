//! Entity model: documents, their sub-records and versioned locators.

mod document;
pub mod locator;
mod post;
mod profile;

pub use document::{Document, DocumentSnapshot, KnownDocument, RemoteUpdate};
pub use locator::{KeyType, Locator, LocatorConflict, LocatorParseError};
pub use post::{now_millis, Post, Reply};
pub use profile::Profile;
