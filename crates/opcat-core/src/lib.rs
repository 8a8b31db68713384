//! Core domain model for the opportunity catalog.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "opcat-core";

pub mod fields {
    pub const ID: &str = "id";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const IS_ACTIVE: &str = "is_active";
    pub const TITLE: &str = "title";
    pub const DESCRIPTION: &str = "description";
    pub const EXTERNAL_URL: &str = "external_url";
    pub const SOURCE_PLATFORM: &str = "source.platform";
    pub const SOURCE_ID: &str = "source.source_id";
    pub const SOURCE_LAST_UPDATED: &str = "source.last_updated";
    pub const START_DATE: &str = "dates.start_date";
    pub const END_DATE: &str = "dates.end_date";
    pub const REGISTRATION_DEADLINE: &str = "dates.registration_deadline";
    pub const LOCATION_CITY: &str = "location.city";
    pub const REGISTRATION_OPEN: &str = "registration.is_open";
    pub const SKILLS_REQUIRED: &str = "skills_required";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityType {
    Hackathon,
    Internship,
    Workshop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Online,
    Offline,
    Hybrid,
}

/// Typed when it has the expected shape, otherwise kept as sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lenient<T> {
    Known(T),
    Unrecognized(JsonValue),
}

impl<T> Lenient<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Lenient::Known(value) => Some(value),
            Lenient::Unrecognized(_) => None,
        }
    }
}

impl<T: Default> Default for Lenient<T> {
    fn default() -> Self {
        Lenient::Known(T::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stamp(#[serde(with = "date_like")] pub DateTime<Utc>);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<Lenient<Stamp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<Lenient<Stamp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_deadline: Option<Lenient<Stamp>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Upstream provenance of a catalog entry. `last_updated` is stamped on write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(default)]
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

/// Only the candidate-key fields must have the right type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOpportunity {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Lenient<String>,
    #[serde(default)]
    pub organizer: Lenient<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Lenient<OpportunityType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Lenient<Mode>>,
    #[serde(default)]
    pub location: Lenient<Location>,
    #[serde(default)]
    pub dates: Lenient<Dates>,
    #[serde(default)]
    pub skills_required: Lenient<Vec<String>>,
    #[serde(default)]
    pub external_url: String,
    #[serde(default)]
    pub source: SourceRef,
    #[serde(default)]
    pub registration: Lenient<Registration>,
}

impl RawOpportunity {
    pub fn from_value(value: JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn display_key(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.external_url
        } else {
            &self.title
        }
    }

    pub fn kind(&self) -> Option<OpportunityType> {
        self.kind.as_ref().and_then(Lenient::known).copied()
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode.as_ref().and_then(Lenient::known).copied()
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.dates
            .known()
            .and_then(|dates| dates.end_date.as_ref())
            .and_then(Lenient::known)
            .map(|stamp| stamp.0)
    }

    /// A listing without a readable end date stays active.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.end_date().map_or(true, |end| end > now)
    }

    /// Adds `is_active` and a fresh `source.last_updated`.
    pub fn to_document(&self, now: DateTime<Utc>) -> Result<JsonValue, serde_json::Error> {
        let mut doc = serde_json::to_value(self)?;
        if let JsonValue::Object(map) = &mut doc {
            map.insert(fields::IS_ACTIVE.to_string(), JsonValue::Bool(self.is_active_at(now)));
            if let Some(JsonValue::Object(source)) = map.get_mut("source") {
                source.insert(
                    "last_updated".to_string(),
                    JsonValue::String(format_timestamp(now)),
                );
            }
        }
        Ok(doc)
    }
}

/// Timestamp format used for every stamp the catalog writes.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// RFC 3339, or a bare `YYYY-MM-DD` read as midnight UTC.
pub fn parse_date_like(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(text) => parse_date_str(text),
        _ => None,
    }
}

pub fn parse_date_str(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.len() < 10 || !text.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if text.len() == 10 {
        let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    None
}

/// Serde adapter for instants held as date-like strings.
pub mod date_like {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_date_str(&text).ok_or_else(|| D::Error::custom(format!("`{text}` is not a date")))
    }
}
