//! Upsert/dedup engine: decide whether an incoming record is new, changed or
//! already current, and write it accordingly.

use chrono::{DateTime, Duration, Utc};
use opcat_core::{fields, parse_date_like, RawOpportunity};
use opcat_storage::document::{document_id, resolve_path};
use opcat_storage::{DocumentCollection, Filter, StorageError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_FRESHNESS_WINDOW_SECS: i64 = 3600;

/// Fields whose change always warrants an update.
pub const SIGNIFICANT_FIELDS: [&str; 8] = [
    fields::TITLE,
    fields::DESCRIPTION,
    fields::START_DATE,
    fields::END_DATE,
    fields::REGISTRATION_DEADLINE,
    fields::LOCATION_CITY,
    fields::REGISTRATION_OPEN,
    fields::EXTERNAL_URL,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Skipped,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("record `{0}` carries no usable candidate key")]
    NoCandidateKey(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Candidate-key filters in priority order. Keys with a missing or blank
/// part are left out.
pub fn candidate_filters(raw: &RawOpportunity) -> Vec<Filter> {
    let platform = non_blank(&raw.source.platform);
    let source_id = raw.source.source_id.as_deref().and_then(non_blank);
    let mut candidates = Vec::with_capacity(3);
    if let (Some(platform), Some(source_id)) = (platform, source_id) {
        candidates.push(
            Filter::new()
                .eq(fields::SOURCE_PLATFORM, platform)
                .eq(fields::SOURCE_ID, source_id),
        );
    }
    if let Some(url) = non_blank(&raw.external_url) {
        candidates.push(Filter::new().eq(fields::EXTERNAL_URL, url));
    }
    if let (Some(title), Some(platform)) = (non_blank(&raw.title), platform) {
        candidates.push(
            Filter::new()
                .eq(fields::TITLE, title)
                .eq(fields::SOURCE_PLATFORM, platform),
        );
    }
    candidates
}

fn non_blank(value: &str) -> Option<&str> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Does `existing` need to be overwritten with `incoming`?
pub fn needs_update(existing: &JsonValue, incoming: &JsonValue, now: DateTime<Utc>, window: Duration) -> bool {
    let last_confirmed = resolve_path(existing, fields::SOURCE_LAST_UPDATED)
        .and_then(parse_date_like)
        .or_else(|| resolve_path(existing, fields::UPDATED_AT).and_then(parse_date_like));
    let stale = match last_confirmed {
        Some(ts) => now - ts > window,
        None => true,
    };
    stale
        || SIGNIFICANT_FIELDS
            .iter()
            .any(|path| values_differ(resolve_path(existing, path), resolve_path(incoming, path)))
}

/// Field-level change test. Absent and null are the same value; instants
/// within one second are the same; strings compare trimmed and case-folded.
pub fn values_differ(old: Option<&JsonValue>, new: Option<&JsonValue>) -> bool {
    static NULL: JsonValue = JsonValue::Null;
    let old = old.unwrap_or(&NULL);
    let new = new.unwrap_or(&NULL);
    if let (Some(a), Some(b)) = (parse_date_like(old), parse_date_like(new)) {
        return (a - b).num_milliseconds().abs() > 1000;
    }
    match (old, new) {
        (JsonValue::String(a), JsonValue::String(b)) => a.trim().to_lowercase() != b.trim().to_lowercase(),
        _ => old != new,
    }
}

/// Best identifying text of a record that may not parse: title, else url.
pub fn record_key(record: &JsonValue) -> String {
    [fields::TITLE, fields::EXTERNAL_URL]
        .iter()
        .filter_map(|path| resolve_path(record, path).and_then(JsonValue::as_str))
        .find(|text| !text.trim().is_empty())
        .unwrap_or("<unidentified>")
        .to_string()
}

pub struct Reconciler<'a> {
    store: &'a dyn DocumentCollection,
    freshness_window: Duration,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn DocumentCollection) -> Self {
        Self {
            store,
            freshness_window: Duration::seconds(DEFAULT_FRESHNESS_WINDOW_SECS),
        }
    }

    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    pub async fn reconcile(&self, record: JsonValue) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile_at(record, Utc::now()).await
    }

    pub async fn reconcile_at(
        &self,
        record: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let raw = RawOpportunity::from_value(record)?;
        let span = info_span!(
            "reconcile",
            platform = %raw.source.platform,
            title = %raw.display_key(),
            kind = ?raw.kind(),
            mode = ?raw.mode()
        );
        self.apply(&raw, now).instrument(span).await
    }

    async fn apply(&self, raw: &RawOpportunity, now: DateTime<Utc>) -> Result<ReconcileOutcome, ReconcileError> {
        let candidates = candidate_filters(raw);
        if candidates.is_empty() {
            return Err(ReconcileError::NoCandidateKey(raw.display_key().to_string()));
        }
        let incoming = raw.to_document(now)?;

        // Keys are tried one at a time so the highest-priority match wins even
        // when a lower-priority key matches an older record.
        let mut previous = None;
        for candidate in &candidates {
            if let Some(doc) = self.store.find_one(candidate).await? {
                previous = Some((candidate, doc));
                break;
            }
        }

        match previous {
            None => {
                let outcome = self.store.upsert(&Filter::new().or(candidates.clone()), incoming).await?;
                debug!(created = outcome.created, "no previous record");
                Ok(if outcome.created {
                    ReconcileOutcome::Created
                } else {
                    ReconcileOutcome::Updated
                })
            }
            Some((candidate, existing)) => {
                if !needs_update(&existing, &incoming, now, self.freshness_window) {
                    debug!("record current; skipped");
                    return Ok(ReconcileOutcome::Skipped);
                }
                let target = match document_id(&existing) {
                    Some(id) => Filter::by_id(id),
                    None => candidate.clone(),
                };
                self.store.upsert(&target, incoming).await?;
                debug!("record updated");
                Ok(ReconcileOutcome::Updated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use opcat_storage::{FileCollection, FindOptions};
    use serde_json::json;
    use tempfile::tempdir;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, h, m, 0).single().unwrap()
    }

    fn hackx() -> JsonValue {
        json!({
            "title": "HackX",
            "type": "hackathon",
            "mode": "online",
            "dates": {"start_date": "2026-11-01T09:00:00Z", "end_date": "2026-11-03T18:00:00Z"},
            "external_url": "https://hackx.org",
            "source": {"platform": "MLH", "source_id": "hackx-1"}
        })
    }

    #[test]
    fn candidates_follow_priority_and_skip_missing_parts() {
        let raw = RawOpportunity::from_value(hackx()).unwrap();
        let keys: Vec<_> = candidate_filters(&raw).iter().map(|f| f.to_json()).collect();
        assert_eq!(
            keys,
            vec![
                json!({"source.platform": "MLH", "source.source_id": "hackx-1"}),
                json!({"external_url": "https://hackx.org"}),
                json!({"title": "HackX", "source.platform": "MLH"}),
            ]
        );

        let mut value = hackx();
        value["source"] = json!({"platform": "MLH"});
        value["external_url"] = json!("  ");
        let raw = RawOpportunity::from_value(value).unwrap();
        let keys: Vec<_> = candidate_filters(&raw).iter().map(|f| f.to_json()).collect();
        assert_eq!(keys, vec![json!({"title": "HackX", "source.platform": "MLH"})]);
    }

    #[test]
    fn value_comparison_rules() {
        let d = |s: &str| json!(s);
        assert!(!values_differ(
            Some(&d("2026-11-01T09:00:00Z")),
            Some(&d("2026-11-01T09:00:00.900Z"))
        ));
        assert!(values_differ(
            Some(&d("2026-11-01T09:00:00Z")),
            Some(&d("2026-11-01T09:00:02Z"))
        ));
        assert!(!values_differ(Some(&d("  HackX ")), Some(&d("hackx"))));
        assert!(values_differ(Some(&d("HackX")), Some(&d("HackY"))));
        assert!(!values_differ(None, Some(&JsonValue::Null)));
        assert!(values_differ(Some(&json!(true)), Some(&json!(false))));
        assert!(values_differ(None, Some(&json!(false))));
    }

    #[test]
    fn freshness_window_forces_updates() {
        let incoming = json!({"title": "HackX"});
        let window = Duration::seconds(3600);
        let existing = json!({"title": "HackX", "source": {"last_updated": "2026-10-18T10:00:00Z"}});
        assert!(needs_update(&existing, &incoming, at(12, 0), window));
        assert!(!needs_update(&existing, &incoming, at(10, 5), window));

        let audit_only = json!({"title": "HackX", "updatedAt": "2026-10-18T11:30:00.000Z"});
        assert!(!needs_update(&audit_only, &incoming, at(12, 0), window));
        assert!(needs_update(&json!({"title": "HackX"}), &incoming, at(12, 0), window));
    }

    #[tokio::test]
    async fn malformed_and_keyless_records_error() {
        let dir = tempdir().expect("tempdir");
        let store = FileCollection::new(dir.path().join("c.json"));
        let reconciler = Reconciler::new(&store);
        assert!(matches!(
            reconciler.reconcile(json!({"title": 42, "external_url": "https://hackx.org"})).await,
            Err(ReconcileError::Malformed(_))
        ));
        assert!(matches!(
            reconciler.reconcile(json!({"title": "no url and no platform"})).await,
            Err(ReconcileError::NoCandidateKey(_))
        ));
        let mut keyless = hackx();
        keyless["title"] = json!("");
        keyless["external_url"] = json!("");
        keyless["source"] = json!({"platform": ""});
        assert!(matches!(
            reconciler.reconcile(keyless).await,
            Err(ReconcileError::NoCandidateKey(_))
        ));
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_skip_update_cycle() {
        let dir = tempdir().expect("tempdir");
        let store = FileCollection::new(dir.path().join("c.json"));
        let reconciler = Reconciler::new(&store);

        assert_eq!(reconciler.reconcile_at(hackx(), at(10, 0)).await.unwrap(), ReconcileOutcome::Created);
        assert_eq!(reconciler.reconcile_at(hackx(), at(10, 5)).await.unwrap(), ReconcileOutcome::Skipped);

        let mut changed = hackx();
        changed["description"] = json!("Now with a hardware track");
        assert_eq!(reconciler.reconcile_at(changed, at(10, 10)).await.unwrap(), ReconcileOutcome::Updated);

        let page = store.find(&Filter::new(), &FindOptions::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0]["description"], json!("Now with a hardware track"));
        assert_eq!(page.items[0]["source"]["last_updated"], json!("2026-10-18T10:10:00.000Z"));
    }
}
