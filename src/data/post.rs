//! Posts and replies

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch, the timestamp unit used throughout.
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// A post, owned by the document that authored it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    /// ID of the authoring document.
    pub author: Uuid,
    pub time: u64,
    pub text: String,
}

impl Post {
    /// A new post with a fresh ID, stamped now.
    pub fn new(author: Uuid, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            time: now_millis(),
            text: text.into(),
        }
    }

    pub fn with_id(id: Uuid, author: Uuid, time: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            author,
            time,
            text: text.into(),
        }
    }
}

/// A reply to a post. The post may belong to another document; it is
/// referenced by ID only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub id: Uuid,
    pub author: Uuid,
    pub post_id: Uuid,
    pub time: u64,
    pub text: String,
}

impl Reply {
    pub fn new(author: Uuid, post_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            post_id,
            time: now_millis(),
            text: text.into(),
        }
    }

    pub fn with_id(
        id: Uuid,
        author: Uuid,
        post_id: Uuid,
        time: u64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id,
            author,
            post_id,
            time,
            text: text.into(),
        }
    }
}
