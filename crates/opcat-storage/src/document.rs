//! Dot-path access and mutation helpers over JSON documents.

use chrono::{DateTime, Utc};
use opcat_core::{fields, format_timestamp};
use serde_json::{Map, Value as JsonValue};

use crate::StorageError;

pub type Document = JsonValue;

pub fn resolve_path<'a>(doc: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Intermediate non-objects are replaced by objects.
pub fn set_path(doc: &mut JsonValue, path: &str, value: JsonValue) {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = JsonValue::Object(Map::new());
        }
        let JsonValue::Object(map) = current else {
            unreachable!("current was just made an object");
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
}

/// `$set` semantics; `id` and `createdAt` are never overwritten.
pub fn apply_patch(doc: &mut JsonValue, patch: &JsonValue) -> Result<(), StorageError> {
    let patch = as_object(patch)?;
    for (key, value) in patch {
        if key == fields::ID || key == fields::CREATED_AT {
            continue;
        }
        set_path(doc, key, value.clone());
    }
    Ok(())
}

pub fn stamp_new(mut data: JsonValue, id: &str, now: DateTime<Utc>) -> Result<Document, StorageError> {
    as_object(&data)?;
    let stamp = JsonValue::String(format_timestamp(now));
    set_path(&mut data, fields::ID, JsonValue::String(id.to_string()));
    set_path(&mut data, fields::CREATED_AT, stamp.clone());
    set_path(&mut data, fields::UPDATED_AT, stamp);
    Ok(data)
}

pub fn touch(doc: &mut JsonValue, now: DateTime<Utc>) {
    set_path(doc, fields::UPDATED_AT, JsonValue::String(format_timestamp(now)));
}

pub fn document_id(doc: &JsonValue) -> Option<&str> {
    doc.get(fields::ID).and_then(JsonValue::as_str)
}

pub fn new_document_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn as_object(value: &JsonValue) -> Result<&Map<String, JsonValue>, StorageError> {
    value
        .as_object()
        .ok_or_else(|| StorageError::InvalidDocument(format!("expected a JSON object, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn resolve_walks_nested_objects_and_reports_absence() {
        let doc = json!({"source": {"platform": "MLH", "meta": null}, "tags": ["a"]});
        assert_eq!(resolve_path(&doc, "source.platform"), Some(&json!("MLH")));
        assert_eq!(resolve_path(&doc, "source.meta"), Some(&JsonValue::Null));
        assert_eq!(resolve_path(&doc, "source.missing"), None);
        assert_eq!(resolve_path(&doc, "source.platform.deeper"), None);
        assert_eq!(resolve_path(&doc, "tags.0"), None);
    }

    #[test]
    fn set_path_creates_and_replaces_intermediates() {
        let mut doc = json!({"source": "flat"});
        set_path(&mut doc, "source.last_updated", json!("now"));
        set_path(&mut doc, "dates.end_date", json!("2026-01-01"));
        assert_eq!(doc, json!({"source": {"last_updated": "now"}, "dates": {"end_date": "2026-01-01"}}));
    }

    #[test]
    fn patch_replaces_subdocuments_but_protects_identity() {
        let mut doc = json!({
            "id": "keep",
            "createdAt": "then",
            "source": {"platform": "MLH", "source_id": "x"},
            "title": "old"
        });
        apply_patch(
            &mut doc,
            &json!({"id": "other", "createdAt": "now", "title": "new", "source.source_id": "y"}),
        )
        .unwrap();
        assert_eq!(doc["id"], json!("keep"));
        assert_eq!(doc["createdAt"], json!("then"));
        assert_eq!(doc["title"], json!("new"));
        assert_eq!(doc["source"], json!({"platform": "MLH", "source_id": "y"}));

        apply_patch(&mut doc, &json!({"source": {"platform": "Devpost"}})).unwrap();
        assert_eq!(doc["source"], json!({"platform": "Devpost"}));
    }

    #[test]
    fn stamping_requires_an_object() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).single().unwrap();
        assert!(matches!(
            stamp_new(json!([1, 2]), "id", now),
            Err(StorageError::InvalidDocument(_))
        ));
        let doc = stamp_new(json!({"title": "t", "id": "caller"}), "fresh", now).unwrap();
        assert_eq!(document_id(&doc), Some("fresh"));
        assert_eq!(doc["createdAt"], doc["updatedAt"]);
    }
}
