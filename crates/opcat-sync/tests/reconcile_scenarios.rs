use chrono::{DateTime, Duration, TimeZone, Utc};
use opcat_storage::{DocumentCollection, FileCollection, Filter};
use opcat_sync::{ReconcileOutcome, Reconciler};
use serde_json::{json, Value as JsonValue};
use tempfile::tempdir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).single().unwrap()
}

fn incoming(title: &str) -> JsonValue {
    json!({
        "title": title,
        "type": "workshop",
        "mode": "hybrid",
        "location": {"city": "Pune"},
        "dates": {"start_date": "2030-05-01", "end_date": "2030-05-02"},
        "external_url": "https://hackx.org",
        "source": {"platform": "MLH", "source_id": "hackx-1"}
    })
}

#[tokio::test]
async fn source_id_match_outranks_url_match() {
    let dir = tempdir().expect("tempdir");
    let store = FileCollection::new(dir.path().join("c.json"));
    let by_url = store
        .create(json!({
            "title": "Legacy listing",
            "external_url": "https://hackx.org",
            "source": {"platform": "MLH", "source_id": "legacy-7"}
        }))
        .await
        .unwrap();
    let by_source_id = store
        .create(json!({
            "title": "HackX (draft)",
            "external_url": "https://old.hackx.org",
            "source": {"platform": "MLH", "source_id": "hackx-1"}
        }))
        .await
        .unwrap();

    let outcome = Reconciler::new(&store).reconcile(incoming("HackX")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated);

    let matched = store.find_by_id(by_source_id["id"].as_str().unwrap()).await.unwrap().unwrap();
    assert_eq!(matched["title"], json!("HackX"));
    assert_eq!(matched["external_url"], json!("https://hackx.org"));
    assert_eq!(matched["createdAt"], by_source_id["createdAt"]);

    let untouched = store.find_by_id(by_url["id"].as_str().unwrap()).await.unwrap().unwrap();
    assert_eq!(untouched, by_url);
    assert_eq!(store.count(&Filter::new()).await.unwrap(), 2);
}

#[tokio::test]
async fn url_match_is_used_when_no_source_id_matches() {
    let dir = tempdir().expect("tempdir");
    let store = FileCollection::new(dir.path().join("c.json"));
    store
        .create(json!({"title": "Renamed", "external_url": "https://hackx.org", "source": {"platform": "Devpost"}}))
        .await
        .unwrap();

    let outcome = Reconciler::new(&store).reconcile(incoming("HackX")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated);
    assert_eq!(store.count(&Filter::new()).await.unwrap(), 1);
    let only = store.find_one(&Filter::new()).await.unwrap().unwrap();
    assert_eq!(only["source"]["source_id"], json!("hackx-1"));
}

#[tokio::test]
async fn stale_records_refresh_and_fresh_ones_skip() {
    let dir = tempdir().expect("tempdir");
    let store = FileCollection::new(dir.path().join("c.json"));
    let reconciler = Reconciler::new(&store);

    assert_eq!(
        reconciler.reconcile_at(incoming("HackX"), t0()).await.unwrap(),
        ReconcileOutcome::Created
    );
    let two_hours_later = t0() + Duration::hours(2);
    assert_eq!(
        reconciler.reconcile_at(incoming("HackX"), two_hours_later).await.unwrap(),
        ReconcileOutcome::Updated
    );
    let five_minutes_after_that = two_hours_later + Duration::minutes(5);
    assert_eq!(
        reconciler.reconcile_at(incoming("HackX"), five_minutes_after_that).await.unwrap(),
        ReconcileOutcome::Skipped
    );

    let stored = store.find_one(&Filter::new()).await.unwrap().unwrap();
    assert_eq!(stored["source"]["last_updated"], json!("2026-10-18T10:00:00.000Z"));
}

#[tokio::test]
async fn cosmetic_differences_do_not_trigger_updates() {
    let dir = tempdir().expect("tempdir");
    let store = FileCollection::new(dir.path().join("c.json"));
    let reconciler = Reconciler::new(&store);
    reconciler.reconcile_at(incoming("HackX"), t0()).await.unwrap();

    let mut shouted = incoming("  HACKX ");
    shouted["location"] = json!({"city": "pune"});
    shouted["dates"] = json!({"start_date": "2030-05-01T00:00:00.400Z", "end_date": "2030-05-02"});
    assert_eq!(
        reconciler.reconcile_at(shouted, t0() + Duration::minutes(1)).await.unwrap(),
        ReconcileOutcome::Skipped
    );

    let mut reopened = incoming("HackX");
    reopened["registration"] = json!({"is_open": true});
    assert_eq!(
        reconciler.reconcile_at(reopened, t0() + Duration::minutes(2)).await.unwrap(),
        ReconcileOutcome::Updated
    );
}

#[tokio::test]
async fn shorter_window_expires_sooner() {
    let dir = tempdir().expect("tempdir");
    let store = FileCollection::new(dir.path().join("c.json"));
    let reconciler = Reconciler::new(&store).with_freshness_window(Duration::minutes(1));
    reconciler.reconcile_at(incoming("HackX"), t0()).await.unwrap();
    assert_eq!(
        reconciler.reconcile_at(incoming("HackX"), t0() + Duration::minutes(5)).await.unwrap(),
        ReconcileOutcome::Updated
    );
}
