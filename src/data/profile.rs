//! Profile value type

use serde::{Deserialize, Serialize};

/// Personal details attached to a document.
///
/// A plain value: documents hand out copies and take copies back, so editing
/// a returned profile has no effect until it is set again.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_day: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_year: Option<u32>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(
        mut self,
        first: Option<&str>,
        middle: Option<&str>,
        last: Option<&str>,
    ) -> Self {
        self.first_name = first.map(str::to_string);
        self.middle_name = middle.map(str::to_string);
        self.last_name = last.map(str::to_string);
        self
    }

    pub fn with_birth_date(mut self, day: Option<u32>, month: Option<u32>, year: Option<u32>) -> Self {
        self.birth_day = day;
        self.birth_month = month;
        self.birth_year = year;
        self
    }

    /// First, middle and last name joined by spaces, if any is set.
    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.first_name, &self.middle_name, &self.last_name]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name() {
        let p = Profile::new().with_name(Some("Ada"), None, Some("Lovelace"));
        assert_eq!(p.full_name().as_deref(), Some("Ada Lovelace"));
        assert_eq!(Profile::new().full_name(), None);
    }

    #[test]
    fn test_serializes_only_present_fields() {
        let p = Profile::new()
            .with_name(Some("Ada"), None, None)
            .with_birth_date(Some(10), Some(12), None);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "first-name": "Ada", "birth-day": 10, "birth-month": 12 })
        );
    }
}
