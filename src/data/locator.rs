//! Versioned locators
//!
//! A locator addresses one logical document on the publish/fetch network.
//! It is bound to a keypair identity for its whole life; only the edition
//! numbers move, and they only move forward.
//!
//! Text form: `USK@<keypair>/<site>/<edition>[/<resource>]`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key type of a locator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// Updatable key: the edition is a hint and may be advanced by the network.
    Usk,
    /// Signed key at a fixed edition.
    Ssk,
}

impl KeyType {
    fn as_str(&self) -> &'static str {
        match self {
            KeyType::Usk => "USK",
            KeyType::Ssk => "SSK",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocatorParseError {
    #[error("missing key type separator '@'")]
    MissingKeyType,

    #[error("unknown key type: {0}")]
    UnknownKeyType(String),

    #[error("empty keypair")]
    EmptyKeypair,

    #[error("missing site name")]
    MissingSite,

    #[error("invalid edition: {0}")]
    InvalidEdition(String),
}

/// Raised when a reconciliation would change a locator's keypair identity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("locator {incoming} tried to overwrite {existing}")]
pub struct LocatorConflict {
    pub existing: String,
    pub incoming: String,
}

/// A versioned address bound to a fixed keypair identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Locator {
    key_type: KeyType,
    keypair: String,
    site: String,
    edition: u64,
    suggested_edition: u64,
    resource: Option<String>,
}

impl Locator {
    /// Create a locator at the given edition. The suggested edition starts
    /// at the same value.
    pub fn new(
        key_type: KeyType,
        keypair: impl Into<String>,
        site: impl Into<String>,
        edition: u64,
    ) -> Self {
        Self {
            key_type,
            keypair: keypair.into(),
            site: site.into(),
            edition,
            suggested_edition: edition,
            resource: None,
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn keypair(&self) -> &str {
        &self.keypair
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn edition(&self) -> u64 {
        self.edition
    }

    pub fn suggested_edition(&self) -> u64 {
        self.suggested_edition
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Two locators with the same keypair identity address the same
    /// logical document.
    pub fn same_keypair(&self, other: &Locator) -> bool {
        self.keypair == other.keypair
    }

    /// Copy of this locator addressing a named resource inside the published
    /// manifest.
    pub fn with_resource(&self, resource: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            ..self.clone()
        }
    }

    /// Copy of this locator without a resource name.
    pub fn without_resource(&self) -> Self {
        Self {
            resource: None,
            ..self.clone()
        }
    }

    pub fn with_key_type(&self, key_type: KeyType) -> Self {
        Self {
            key_type,
            ..self.clone()
        }
    }

    /// Copy with an explicit suggested edition, used to force the hint handed
    /// to the publish capability. This is the only way to lower the hint and
    /// it never touches the stored locator.
    pub fn with_suggested_edition(&self, suggested_edition: u64) -> Self {
        Self {
            suggested_edition,
            ..self.clone()
        }
    }

    /// Fold an incoming locator into this one.
    ///
    /// The keypair identity never changes; a mismatch is returned as a
    /// [`LocatorConflict`] and `self` is left untouched. Otherwise the
    /// suggested edition becomes the maximum of the current edition, the
    /// current suggestion and the incoming edition.
    pub fn reconcile(&mut self, incoming: &Locator) -> Result<(), LocatorConflict> {
        if !self.same_keypair(incoming) {
            return Err(LocatorConflict {
                existing: self.to_string(),
                incoming: incoming.to_string(),
            });
        }
        self.suggested_edition = self
            .suggested_edition
            .max(self.edition)
            .max(incoming.edition);
        Ok(())
    }

    /// Raise the suggested edition to at least `edition`.
    pub fn suggest(&mut self, edition: u64) {
        self.suggested_edition = self.suggested_edition.max(edition);
    }

    /// Record that `edition` now exists on the network.
    pub fn advance_to(&mut self, edition: u64) {
        if self.edition < edition {
            self.edition = edition;
        }
        self.suggest(edition);
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}/{}",
            self.key_type.as_str(),
            self.keypair,
            self.site,
            self.suggested_edition
        )?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl FromStr for Locator {
    type Err = LocatorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key_type, rest) = s
            .trim()
            .split_once('@')
            .ok_or(LocatorParseError::MissingKeyType)?;
        let key_type = match key_type {
            "USK" => KeyType::Usk,
            "SSK" => KeyType::Ssk,
            other => return Err(LocatorParseError::UnknownKeyType(other.to_string())),
        };

        let mut parts = rest.splitn(4, '/');
        let keypair = parts.next().unwrap_or_default();
        if keypair.is_empty() {
            return Err(LocatorParseError::EmptyKeypair);
        }
        let site = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(LocatorParseError::MissingSite)?;
        let edition = match parts.next() {
            Some(e) => e
                .parse::<u64>()
                .map_err(|_| LocatorParseError::InvalidEdition(e.to_string()))?,
            None => 0,
        };
        let resource = parts.next().filter(|r| !r.is_empty()).map(str::to_string);

        Ok(Self {
            key_type,
            keypair: keypair.to_string(),
            site: site.to_string(),
            edition,
            suggested_edition: edition,
            resource,
        })
    }
}

impl Serialize for Locator {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Locator {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usk(keypair: &str, edition: u64) -> Locator {
        Locator::new(KeyType::Usk, keypair, "Sone", edition)
    }

    #[test]
    fn test_parse_and_display() {
        let loc: Locator = "USK@abc,def,AQACAAE/Sone/12".parse().unwrap();
        assert_eq!(loc.key_type(), KeyType::Usk);
        assert_eq!(loc.keypair(), "abc,def,AQACAAE");
        assert_eq!(loc.site(), "Sone");
        assert_eq!(loc.edition(), 12);
        assert_eq!(loc.suggested_edition(), 12);
        assert_eq!(loc.resource(), None);
        assert_eq!(loc.to_string(), "USK@abc,def,AQACAAE/Sone/12");
    }

    #[test]
    fn test_parse_with_resource() {
        let loc: Locator = "SSK@key/Sone/3/sone.json".parse().unwrap();
        assert_eq!(loc.key_type(), KeyType::Ssk);
        assert_eq!(loc.resource(), Some("sone.json"));
        assert_eq!(loc.without_resource().to_string(), "SSK@key/Sone/3");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(
            "no-at-sign".parse::<Locator>(),
            Err(LocatorParseError::MissingKeyType)
        );
        assert_eq!(
            "CHK@key/Sone/1".parse::<Locator>(),
            Err(LocatorParseError::UnknownKeyType("CHK".into()))
        );
        assert_eq!(
            "USK@/Sone/1".parse::<Locator>(),
            Err(LocatorParseError::EmptyKeypair)
        );
        assert_eq!(
            "USK@key".parse::<Locator>(),
            Err(LocatorParseError::MissingSite)
        );
        assert!(matches!(
            "USK@key/Sone/x".parse::<Locator>(),
            Err(LocatorParseError::InvalidEdition(_))
        ));
    }

    #[test]
    fn test_reconcile_raises_suggestion() {
        let mut loc = usk("k", 3);
        loc.reconcile(&usk("k", 7)).unwrap();
        assert_eq!(loc.edition(), 3);
        assert_eq!(loc.suggested_edition(), 7);
    }

    #[test]
    fn test_reconcile_never_lowers() {
        let mut loc = usk("k", 3);
        loc.reconcile(&usk("k", 9)).unwrap();
        loc.reconcile(&usk("k", 1)).unwrap();
        assert_eq!(loc.suggested_edition(), 9);

        // A stale suggestion is still lifted to the known edition.
        let mut stale = usk("k", 5).with_suggested_edition(2);
        stale.reconcile(&usk("k", 4)).unwrap();
        assert_eq!(stale.suggested_edition(), 5);
    }

    #[test]
    fn test_reconcile_sequence_is_monotonic() {
        let mut loc = usk("k", 0);
        let mut last = loc.suggested_edition();
        for edition in [4, 2, 8, 8, 0, 11, 3] {
            loc.reconcile(&usk("k", edition)).unwrap();
            assert!(loc.suggested_edition() >= last);
            last = loc.suggested_edition();
        }
        assert_eq!(last, 11);
    }

    #[test]
    fn test_reconcile_keypair_mismatch_leaves_locator_unchanged() {
        let mut loc = usk("mine", 4);
        let before = loc.clone();
        let err = loc.reconcile(&usk("theirs", 40)).unwrap_err();
        assert_eq!(loc, before);
        assert!(err.to_string().contains("USK@theirs/Sone/40"));
    }

    #[test]
    fn test_advance_to() {
        let mut loc = usk("k", 2);
        loc.advance_to(5);
        assert_eq!(loc.edition(), 5);
        assert_eq!(loc.suggested_edition(), 5);

        loc.advance_to(1);
        assert_eq!(loc.edition(), 5);
    }

    #[test]
    fn test_serde_uses_text_form() {
        let loc = usk("k", 6);
        let json = serde_json::to_string(&loc).unwrap();
        assert_eq!(json, "\"USK@k/Sone/6\"");
        let back: Locator = serde_json::from_str(&json).unwrap();
        assert_eq!(back, loc);
    }
}
