use chrono::{DateTime, Utc};
use opcat_core::{fields, format_timestamp};
use opcat_storage::query::date_bound;
use opcat_storage::{DocumentCollection, Filter, StorageError};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deactivated: usize,
}

/// Deactivates active records whose end date has passed.
pub struct ExpirationSweep<'a> {
    store: &'a dyn DocumentCollection,
}

impl<'a> ExpirationSweep<'a> {
    pub fn new(store: &'a dyn DocumentCollection) -> Self {
        Self { store }
    }

    pub async fn run(&self) -> Result<SweepReport, StorageError> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StorageError> {
        let expired = Filter::new()
            .eq(fields::IS_ACTIVE, true)
            .lt(fields::END_DATE, date_bound(now));

        let mut patch = Map::new();
        patch.insert(fields::IS_ACTIVE.to_string(), JsonValue::Bool(false));
        patch.insert(
            fields::SOURCE_LAST_UPDATED.to_string(),
            JsonValue::String(format_timestamp(now)),
        );

        let deactivated = self
            .store
            .update_many(&expired, JsonValue::Object(patch))
            .instrument(info_span!("expiration_sweep"))
            .await?;
        info!(deactivated, "expiration sweep finished");
        Ok(SweepReport { deactivated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use opcat_storage::FileCollection;
    use serde_json::json;
    use tempfile::tempdir;

    fn listing(title: &str, end: &str, active: bool) -> JsonValue {
        json!({
            "title": title,
            "is_active": active,
            "dates": {"start_date": "2026-01-01T00:00:00Z", "end_date": end},
            "source": {"platform": "MLH", "last_updated": "2026-01-01T00:00:00.000Z"}
        })
    }

    #[tokio::test]
    async fn deactivates_expired_records_once() {
        let dir = tempdir().expect("tempdir");
        let store = FileCollection::new(dir.path().join("c.json"));
        store.create(listing("past", "2026-10-01T00:00:00Z", true)).await.unwrap();
        store.create(listing("bare date", "2026-10-17", true)).await.unwrap();
        store.create(listing("future", "2026-12-01T00:00:00Z", true)).await.unwrap();
        store.create(listing("already off", "2026-09-01T00:00:00Z", false)).await.unwrap();

        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).single().unwrap();
        let sweep = ExpirationSweep::new(&store);
        assert_eq!(sweep.run_at(now).await.unwrap().deactivated, 2);
        assert_eq!(sweep.run_at(now).await.unwrap().deactivated, 0);

        let past = store.find_one(&Filter::new().eq("title", "past")).await.unwrap().unwrap();
        assert_eq!(past["is_active"], json!(false));
        assert_eq!(past["source"]["last_updated"], json!("2026-10-18T12:00:00.000Z"));
        assert_eq!(past["source"]["platform"], json!("MLH"));

        let active = store.count(&Filter::new().eq("is_active", true)).await.unwrap();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn records_without_a_date_are_left_alone() {
        let dir = tempdir().expect("tempdir");
        let store = FileCollection::new(dir.path().join("c.json"));
        store.create(json!({"title": "undated", "is_active": true})).await.unwrap();
        store.create(listing("garbled", "next tuesday", true)).await.unwrap();
        assert_eq!(ExpirationSweep::new(&store).run().await.unwrap().deactivated, 0);
    }
}
