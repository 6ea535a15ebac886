//! Document wire format
//!
//! A published document is a manifest holding a small landing page and the
//! structured export, a JSON object:
//!
//! ```text
//! {
//!   "id": "<uuid>", "name": "...", "time": <millis>,
//!   "request-uri": "USK@.../Sone/<edition>",          (optional)
//!   "insert-uri": "...",                               (optional, input only)
//!   "profile": { "first-name", "middle-name", "last-name",
//!                "birth-day", "birth-month", "birth-year" },
//!   "posts":       [ { "id", "time", "text" } ],
//!   "replies":     [ { "id", "post-id", "time", "text" } ],
//!   "post-likes":  [ "<uuid>" ],
//!   "reply-likes": [ "<uuid>" ],
//!   "known-sones": [ { "sone-id", "sone-key", "sone-name" } ]
//! }
//! ```
//!
//! Decoding validates the whole object before returning anything, so a
//! caller either gets a complete [`DecodedDocument`] or a [`ValidationError`].

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::transport::{Manifest, ManifestEntry};
use super::{SyncError, ValidationError};
use crate::data::{DocumentSnapshot, KnownDocument, Locator, Post, Profile, RemoteUpdate, Reply};

/// Default entry of every published manifest.
pub const LANDING_PAGE: &str = "index.html";
pub const DEFAULT_RESOURCE_NAME: &str = "sone.json";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
pub const DOCUMENT_CONTENT_TYPE: &str = "application/json; charset=utf-8";

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct WireDocument<'a> {
    id: Uuid,
    name: &'a str,
    time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_uri: Option<String>,
    profile: &'a Profile,
    posts: Vec<WirePost<'a>>,
    replies: Vec<WireReply<'a>>,
    post_likes: Vec<Uuid>,
    reply_likes: Vec<Uuid>,
    known_sones: Vec<WireKnownDocument<'a>>,
}

#[derive(Serialize)]
struct WirePost<'a> {
    id: Uuid,
    time: u64,
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct WireReply<'a> {
    id: Uuid,
    post_id: Uuid,
    time: u64,
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct WireKnownDocument<'a> {
    sone_id: Uuid,
    sone_key: String,
    sone_name: &'a str,
}

/// Serialize a snapshot. The private locator is never written.
pub fn encode_document(
    snapshot: &DocumentSnapshot,
    known: &[KnownDocument],
) -> Result<Vec<u8>, SyncError> {
    let wire = WireDocument {
        id: snapshot.id,
        name: snapshot.name.as_deref().unwrap_or_default(),
        time: snapshot.time,
        request_uri: snapshot
            .request_locator
            .as_ref()
            .map(|l| l.without_resource().to_string()),
        profile: &snapshot.profile,
        posts: snapshot
            .posts
            .iter()
            .map(|p| WirePost {
                id: p.id,
                time: p.time,
                text: &p.text,
            })
            .collect(),
        replies: snapshot
            .replies
            .iter()
            .map(|r| WireReply {
                id: r.id,
                post_id: r.post_id,
                time: r.time,
                text: &r.text,
            })
            .collect(),
        post_likes: snapshot.liked_post_ids.iter().copied().collect(),
        reply_likes: snapshot.liked_reply_ids.iter().copied().collect(),
        known_sones: known
            .iter()
            .map(|k| WireKnownDocument {
                sone_id: k.id,
                sone_key: k.locator.without_resource().to_string(),
                sone_name: &k.name,
            })
            .collect(),
    };
    serde_json::to_vec_pretty(&wire).map_err(|e| SyncError::Serialization(e.to_string()))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// The fixed landing page shown to anyone opening the locator in a browser.
pub fn render_landing_page(snapshot: &DocumentSnapshot, resource_name: &str) -> String {
    let name = escape_html(snapshot.name.as_deref().unwrap_or("Unnamed"));
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{name}</title></head>\n<body>\n\
         <h1>{name}</h1>\n\
         <p>This is a social identity document with {posts} posts and {replies} replies.</p>\n\
         <p>Its structured export is available as <a href=\"{resource}\">{resource}</a>.</p>\n\
         </body>\n</html>\n",
        posts = snapshot.posts.len(),
        replies = snapshot.replies.len(),
        resource = escape_html(resource_name),
    )
}

/// Build the manifest inserted for one document version.
pub fn build_manifest(
    snapshot: &DocumentSnapshot,
    known: &[KnownDocument],
    resource_name: &str,
) -> Result<Manifest, SyncError> {
    let mut manifest = Manifest::new();
    manifest.insert(
        LANDING_PAGE.to_string(),
        ManifestEntry::new(
            render_landing_page(snapshot, resource_name).into_bytes(),
            HTML_CONTENT_TYPE,
        ),
    );
    manifest.insert(
        resource_name.to_string(),
        ManifestEntry::new(encode_document(snapshot, known)?, DOCUMENT_CONTENT_TYPE),
    );
    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// A fully validated remote document version.
#[derive(Clone, Debug)]
pub struct DecodedDocument {
    pub id: Uuid,
    pub name: String,
    pub time: u64,
    pub request_locator: Option<Locator>,
    pub insert_locator: Option<Locator>,
    pub profile: Profile,
    pub posts: Vec<Post>,
    pub replies: Vec<Reply>,
    pub liked_post_ids: HashSet<Uuid>,
    pub liked_reply_ids: HashSet<Uuid>,
    pub known_documents: Vec<KnownDocument>,
    /// List sections that were absent from the payload.
    pub missing_sections: Vec<&'static str>,
}

impl DecodedDocument {
    /// Split into the update for the document itself and the peers it
    /// advertises.
    pub fn into_parts(self) -> (RemoteUpdate, Vec<KnownDocument>) {
        let update = RemoteUpdate {
            name: self.name,
            time: self.time,
            request_locator: self.request_locator,
            insert_locator: self.insert_locator,
            profile: self.profile,
            posts: self.posts,
            replies: self.replies,
            liked_post_ids: self.liked_post_ids,
            liked_reply_ids: self.liked_reply_ids,
        };
        (update, self.known_documents)
    }
}

fn get<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|v| !v.is_null())
}

fn text<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    get(object, key).and_then(Value::as_str)
}

fn timestamp(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn small_number(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn locator(object: &Map<String, Value>, key: &'static str) -> Result<Option<Locator>, ValidationError> {
    match get(object, key) {
        None => Ok(None),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| ValidationError::BadLocator {
                field: key,
                value: s.clone(),
            }),
        Some(other) => Err(ValidationError::BadLocator {
            field: key,
            value: other.to_string(),
        }),
    }
}

fn section<'a>(
    object: &'a Map<String, Value>,
    key: &'static str,
    missing: &mut Vec<&'static str>,
) -> Result<&'a [Value], ValidationError> {
    match get(object, key) {
        None => {
            missing.push(key);
            Ok(&[][..])
        }
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(ValidationError::Malformed(format!("{key} is not a list"))),
    }
}

fn entry<'a>(
    item: &'a Value,
    section: &'static str,
) -> Result<&'a Map<String, Value>, ValidationError> {
    item.as_object().ok_or_else(|| ValidationError::BadSubEntity {
        section,
        reason: format!("entry is not an object: {item}"),
    })
}

fn entry_id(
    object: &Map<String, Value>,
    key: &str,
    section: &'static str,
) -> Result<Uuid, ValidationError> {
    let raw = text(object, key).ok_or_else(|| ValidationError::BadSubEntity {
        section,
        reason: format!("missing {key}"),
    })?;
    Uuid::parse_str(raw).map_err(|_| ValidationError::BadSubEntity {
        section,
        reason: format!("invalid {key}: {raw}"),
    })
}

fn entry_time(object: &Map<String, Value>, section: &'static str) -> Result<u64, ValidationError> {
    let raw = get(object, "time").ok_or_else(|| ValidationError::BadSubEntity {
        section,
        reason: "missing time".to_string(),
    })?;
    timestamp(raw).ok_or_else(|| ValidationError::BadSubEntity {
        section,
        reason: format!("invalid time: {raw}"),
    })
}

fn entry_text(object: &Map<String, Value>, section: &'static str) -> Result<String, ValidationError> {
    text(object, "text")
        .map(str::to_string)
        .ok_or_else(|| ValidationError::BadSubEntity {
            section,
            reason: "missing text".to_string(),
        })
}

fn id_list(items: &[Value], section: &'static str, owner: Uuid) -> HashSet<Uuid> {
    items
        .iter()
        .filter_map(|item| match item.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
            Some(id) => Some(id),
            None => {
                log::warn!("Dropping invalid entry {} in {} of {}", item, section, owner);
                None
            }
        })
        .collect()
}

/// Decode and validate a document payload.
///
/// `expected_id` is the ID of the document the payload was fetched for; a
/// payload declaring any other ID is refused before anything else is read.
pub fn decode_document(
    bytes: &[u8],
    expected_id: Option<Uuid>,
) -> Result<DecodedDocument, ValidationError> {
    let root: Value =
        serde_json::from_slice(bytes).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    let root = root
        .as_object()
        .ok_or_else(|| ValidationError::Malformed("document is not an object".to_string()))?;

    let declared = text(root, "id").ok_or(ValidationError::MissingField("id"))?;
    let id = match (expected_id, Uuid::parse_str(declared)) {
        (Some(expected), Ok(id)) if id == expected => id,
        (Some(expected), _) => {
            return Err(ValidationError::IdMismatch {
                expected,
                declared: declared.to_string(),
            })
        }
        (None, Ok(id)) => id,
        (None, Err(_)) => {
            return Err(ValidationError::Malformed(format!("invalid id: {declared}")))
        }
    };

    let name = text(root, "name").ok_or(ValidationError::MissingField("name"))?;
    let raw_time = get(root, "time").ok_or(ValidationError::MissingField("time"))?;
    let time = timestamp(raw_time).ok_or_else(|| ValidationError::BadTimestamp {
        field: "time",
        value: raw_time.to_string(),
    })?;

    let request_locator = locator(root, "request-uri")?;
    let insert_locator = locator(root, "insert-uri")?;

    let profile = match get(root, "profile") {
        None => return Err(ValidationError::MissingField("profile")),
        Some(Value::Object(p)) => Profile {
            first_name: text(p, "first-name").map(str::to_string),
            middle_name: text(p, "middle-name").map(str::to_string),
            last_name: text(p, "last-name").map(str::to_string),
            birth_day: small_number(get(p, "birth-day")),
            birth_month: small_number(get(p, "birth-month")),
            birth_year: small_number(get(p, "birth-year")),
        },
        Some(_) => return Err(ValidationError::Malformed("profile is not an object".to_string())),
    };

    let mut missing_sections = Vec::new();

    let mut posts = Vec::new();
    for item in section(root, "posts", &mut missing_sections)? {
        let post = entry(item, "posts")?;
        posts.push(Post::with_id(
            entry_id(post, "id", "posts")?,
            id,
            entry_time(post, "posts")?,
            entry_text(post, "posts")?,
        ));
    }

    let mut replies = Vec::new();
    for item in section(root, "replies", &mut missing_sections)? {
        let reply = entry(item, "replies")?;
        replies.push(Reply::with_id(
            entry_id(reply, "id", "replies")?,
            id,
            entry_id(reply, "post-id", "replies")?,
            entry_time(reply, "replies")?,
            entry_text(reply, "replies")?,
        ));
    }

    let liked_post_ids = id_list(
        section(root, "post-likes", &mut missing_sections)?,
        "post-likes",
        id,
    );
    let liked_reply_ids = id_list(
        section(root, "reply-likes", &mut missing_sections)?,
        "reply-likes",
        id,
    );

    let mut known_documents = Vec::new();
    for item in section(root, "known-sones", &mut missing_sections)? {
        let known = entry(item, "known-sones")?;
        let known_id = entry_id(known, "sone-id", "known-sones")?;
        let key = text(known, "sone-key").ok_or_else(|| ValidationError::BadSubEntity {
            section: "known-sones",
            reason: "missing sone-key".to_string(),
        })?;
        let known_locator = key.parse().map_err(|_| ValidationError::BadSubEntity {
            section: "known-sones",
            reason: format!("invalid sone-key: {key}"),
        })?;
        let known_name = text(known, "sone-name").ok_or_else(|| ValidationError::BadSubEntity {
            section: "known-sones",
            reason: "missing sone-name".to_string(),
        })?;
        known_documents.push(KnownDocument {
            id: known_id,
            locator: known_locator,
            name: known_name.to_string(),
        });
    }

    Ok(DecodedDocument {
        id,
        name: name.to_string(),
        time,
        request_locator,
        insert_locator,
        profile,
        posts,
        replies,
        liked_post_ids,
        liked_reply_ids,
        known_documents,
        missing_sections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Document, KeyType};
    use serde_json::json;

    fn alice_payload(id: Uuid) -> Value {
        json!({
            "id": id.to_string(),
            "name": "Alice",
            "time": 1000,
            "profile": {},
            "posts": [ { "id": Uuid::new_v4().to_string(), "time": 999, "text": "hi" } ],
            "replies": [],
            "post-likes": [],
            "reply-likes": [],
            "known-sones": []
        })
    }

    fn bytes(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[test]
    fn test_decode_minimal_document() {
        let id = Uuid::new_v4();
        let decoded = decode_document(&bytes(&alice_payload(id)), None).unwrap();
        assert_eq!(decoded.id, id);
        assert_eq!(decoded.name, "Alice");
        assert_eq!(decoded.time, 1000);
        assert_eq!(decoded.posts.len(), 1);
        assert_eq!(decoded.posts[0].text, "hi");
        assert_eq!(decoded.posts[0].author, id);
        assert!(decoded.profile.is_empty());
        assert!(decoded.missing_sections.is_empty());
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(matches!(
            decode_document(b"<sone/>", None),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            decode_document(b"[1, 2]", None),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_id_mismatch_wins_over_missing_fields() {
        let expected = Uuid::new_v4();
        let payload = json!({ "id": Uuid::new_v4().to_string() });
        assert!(matches!(
            decode_document(&bytes(&payload), Some(expected)),
            Err(ValidationError::IdMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_required_scalars() {
        let id = Uuid::new_v4();
        let mut payload = alice_payload(id);
        payload.as_object_mut().unwrap().remove("name");
        assert_eq!(
            decode_document(&bytes(&payload), Some(id)).unwrap_err(),
            ValidationError::MissingField("name")
        );

        let mut payload = alice_payload(id);
        payload["time"] = json!("yesterday");
        assert!(matches!(
            decode_document(&bytes(&payload), Some(id)),
            Err(ValidationError::BadTimestamp { field: "time", .. })
        ));

        let mut payload = alice_payload(id);
        payload.as_object_mut().unwrap().remove("profile");
        assert_eq!(
            decode_document(&bytes(&payload), Some(id)).unwrap_err(),
            ValidationError::MissingField("profile")
        );
    }

    #[test]
    fn test_decode_accepts_string_timestamps() {
        let id = Uuid::new_v4();
        let mut payload = alice_payload(id);
        payload["time"] = json!("1234");
        assert_eq!(decode_document(&bytes(&payload), None).unwrap().time, 1234);
    }

    #[test]
    fn test_decode_bad_post_aborts() {
        let id = Uuid::new_v4();
        let mut payload = alice_payload(id);
        payload["posts"] = json!([
            { "id": Uuid::new_v4().to_string(), "time": 1, "text": "ok" },
            { "id": Uuid::new_v4().to_string(), "time": 2 }
        ]);
        assert!(matches!(
            decode_document(&bytes(&payload), None),
            Err(ValidationError::BadSubEntity { section: "posts", .. })
        ));

        payload["posts"] = json!([{ "id": Uuid::new_v4().to_string(), "time": "soon", "text": "x" }]);
        assert!(matches!(
            decode_document(&bytes(&payload), None),
            Err(ValidationError::BadSubEntity { section: "posts", .. })
        ));
    }

    fn rejection_reason(payload: &Value, section: &str) -> String {
        match decode_document(&bytes(payload), None) {
            Err(ValidationError::BadSubEntity { section: s, reason }) if s == section => reason,
            other => panic!("expected a bad {section} entry, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_bad_reply_aborts() {
        let id = Uuid::new_v4();
        let post = Uuid::new_v4().to_string();
        let good = json!({ "id": Uuid::new_v4().to_string(), "post-id": post, "time": 1, "text": "ok" });
        let mut payload = alice_payload(id);

        payload["replies"] = json!([good, { "id": Uuid::new_v4().to_string(), "time": 2, "text": "x" }]);
        assert_eq!(rejection_reason(&payload, "replies"), "missing post-id");

        payload["replies"] = json!([good, { "id": "reply-7", "post-id": post, "time": 2, "text": "x" }]);
        assert_eq!(rejection_reason(&payload, "replies"), "invalid id: reply-7");

        payload["replies"] = json!([good, { "id": Uuid::new_v4().to_string(), "post-id": post, "time": "later", "text": "x" }]);
        assert!(rejection_reason(&payload, "replies").starts_with("invalid time"));

        payload["replies"] = json!([good]);
        assert_eq!(decode_document(&bytes(&payload), None).unwrap().replies.len(), 1);
    }

    #[test]
    fn test_decode_incomplete_known_document_aborts() {
        let id = Uuid::new_v4();
        let peer = Uuid::new_v4().to_string();
        let mut payload = alice_payload(id);

        payload["known-sones"] = json!([{ "sone-id": peer, "sone-key": "USK@peer/Sone/4" }]);
        assert_eq!(rejection_reason(&payload, "known-sones"), "missing sone-name");

        payload["known-sones"] = json!([{ "sone-key": "USK@peer/Sone/4", "sone-name": "Bob" }]);
        assert_eq!(rejection_reason(&payload, "known-sones"), "missing sone-id");

        payload["known-sones"] = json!([{ "sone-id": peer, "sone-name": "Bob" }]);
        assert_eq!(rejection_reason(&payload, "known-sones"), "missing sone-key");
    }

    #[test]
    fn test_decode_missing_sections_only_reported() {
        let id = Uuid::new_v4();
        let payload = json!({ "id": id.to_string(), "name": "A", "time": 5, "profile": {} });
        let decoded = decode_document(&bytes(&payload), None).unwrap();
        assert_eq!(
            decoded.missing_sections,
            vec!["posts", "replies", "post-likes", "reply-likes", "known-sones"]
        );
    }

    #[test]
    fn test_decode_profile_fields_are_lenient() {
        let id = Uuid::new_v4();
        let mut payload = alice_payload(id);
        payload["profile"] = json!({
            "first-name": "Alice",
            "birth-day": "12",
            "birth-month": 13000000000u64,
            "birth-year": "nineteen"
        });
        let profile = decode_document(&bytes(&payload), None).unwrap().profile;
        assert_eq!(profile.first_name.as_deref(), Some("Alice"));
        assert_eq!(profile.birth_day, Some(12));
        assert_eq!(profile.birth_month, None);
        assert_eq!(profile.birth_year, None);
    }

    #[test]
    fn test_decode_known_documents() {
        let id = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut payload = alice_payload(id);
        payload["known-sones"] = json!([
            { "sone-id": peer.to_string(), "sone-key": "USK@peer/Sone/4", "sone-name": "Bob" }
        ]);
        let decoded = decode_document(&bytes(&payload), None).unwrap();
        assert_eq!(decoded.known_documents.len(), 1);
        assert_eq!(decoded.known_documents[0].id, peer);
        assert_eq!(decoded.known_documents[0].locator.edition(), 4);

        payload["known-sones"] = json!([{ "sone-id": peer.to_string(), "sone-key": "garbage", "sone-name": "Bob" }]);
        assert!(matches!(
            decode_document(&bytes(&payload), None),
            Err(ValidationError::BadSubEntity { section: "known-sones", .. })
        ));
    }

    #[test]
    fn test_decode_bad_request_uri() {
        let id = Uuid::new_v4();
        let mut payload = alice_payload(id);
        payload["request-uri"] = json!("not a locator");
        assert!(matches!(
            decode_document(&bytes(&payload), None),
            Err(ValidationError::BadLocator { field: "request-uri", .. })
        ));
    }

    #[test]
    fn test_encoded_document_decodes_back() {
        let doc = Document::generate();
        doc.set_name("Carol");
        doc.set_time(77);
        doc.set_request_locator(Locator::new(KeyType::Usk, "carol", "Sone", 3))
            .unwrap();
        doc.set_insert_locator(Locator::new(KeyType::Usk, "carol-private", "Sone", 3))
            .unwrap();
        let post = Post::new(doc.id(), "a post");
        doc.add_post(post.clone());
        doc.add_reply(Reply::new(doc.id(), post.id, "a reply"));
        doc.add_liked_post(post.id);

        let bytes = encode_document(&doc.snapshot(), &[]).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains("carol-private"));
        assert!(!text.contains("insert-uri"));

        let decoded = decode_document(&bytes, Some(doc.id())).unwrap();
        assert_eq!(decoded.name, "Carol");
        assert_eq!(decoded.posts, doc.posts());
        assert_eq!(decoded.replies, doc.replies());
        assert_eq!(decoded.liked_post_ids, doc.liked_post_ids());
        assert_eq!(decoded.request_locator, doc.request_locator());
        assert!(decoded.insert_locator.is_none());
    }

    #[test]
    fn test_manifest_entries() {
        let doc = Document::generate();
        doc.set_name("<script>");
        let manifest = build_manifest(&doc.snapshot(), &[], DEFAULT_RESOURCE_NAME).unwrap();
        assert_eq!(manifest.len(), 2);

        let page = &manifest[LANDING_PAGE];
        assert_eq!(page.content_type, HTML_CONTENT_TYPE);
        let html = String::from_utf8(page.data.clone()).unwrap();
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("sone.json"));

        assert_eq!(manifest[DEFAULT_RESOURCE_NAME].content_type, DOCUMENT_CONTENT_TYPE);
    }
}
