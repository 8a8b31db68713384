//! File and Postgres collections must select the same records for every
//! supported filter. Needs a scratch database:
//!
//! `OPCAT_TEST_DATABASE_URL=postgres://... cargo test -p opcat-storage --test backend_equivalence`

use opcat_storage::{DocumentCollection, FileCollection, Filter, FindOptions, PgCollection, Sort};
use serde_json::{json, Value};

fn corpus() -> Vec<Value> {
    vec![
        json!({
            "key": "hackx",
            "title": "HackX",
            "type": "hackathon",
            "is_active": true,
            "external_url": "https://hackx.org",
            "skills_required": ["Rust", "Machine Learning"],
            "location": {"city": "Berlin"},
            "dates": {"start_date": "2026-11-01T09:00:00Z", "end_date": "2026-11-03T18:00:00.000Z"},
            "source": {"platform": "MLH", "source_id": "hackx-1"},
            "prize_pool": 5000
        }),
        json!({
            "key": "intern",
            "title": "Backend Internship",
            "type": "internship",
            "is_active": true,
            "external_url": "https://jobs.example/intern",
            "skills_required": ["Go"],
            "location": {"city": "berlin"},
            "dates": {"start_date": "2026-06-01", "end_date": "2026-09-01"},
            "source": {"platform": "Devpost"},
            "prize_pool": 0
        }),
        json!({
            "key": "expired",
            "title": "Old Workshop\nsecond line",
            "type": "workshop",
            "is_active": false,
            "external_url": "https://old.example",
            "skills_required": [],
            "dates": {"start_date": "2025-01-01T00:00:00Z", "end_date": "2025-01-02T00:00:00+05:30"},
            "source": {"platform": "MLH", "source_id": "old-1"}
        }),
        json!({
            "key": "odd",
            "title": "2026-01-01",
            "type": "workshop",
            "is_active": "yes",
            "external_url": null,
            "skills_required": "Rust",
            "location": {"city": ["Pune", "Delhi"]},
            "dates": {"start_date": "tbd", "end_date": 20261231},
            "source": {"platform": "mlh", "source_id": 7},
            "prize_pool": "5000"
        }),
        json!({
            "key": "ecole",
            "title": "ÉCOLE 42 hack-night on planet",
            "type": "workshop",
            "is_active": true,
            "external_url": "https://ecole.example/hack",
            "skills_required": ["C"],
            "location": {"city": "Paris"},
            "source": {"platform": "Devpost", "source_id": "ecole-42"}
        }),
    ]
}

fn filters() -> Vec<Value> {
    vec![
        json!({}),
        json!({"source.platform": "MLH"}),
        json!({"source.platform": "MLH", "source.source_id": "hackx-1"}),
        json!({"source.source_id": null}),
        json!({"external_url": null}),
        json!({"is_active": true}),
        json!({"skills_required": "Rust"}),
        json!({"skills_required": ["Rust", "Machine Learning"]}),
        json!({"location": {"city": "Berlin"}}),
        json!({"location.city": "Pune"}),
        json!({"title": {"$regex": "hack"}}),
        json!({"title": {"$regex": "hack", "$options": ""}}),
        json!({"title": {"$regex": "line$"}}),
        json!({"title": {"$regex": "line$", "$options": "m"}}),
        json!({"title": {"$regex": "workshop.second", "$options": "is"}}),
        json!({"location.city": {"$regex": "^p"}}),
        json!({"title": {"$regex": "\\bhack"}}),
        json!({"title": {"$regex": "k\\b", "$options": ""}}),
        json!({"title": {"$regex": "workshop[^x]second"}}),
        json!({"title": {"$regex": "planet\\z"}}),
        json!({"title": {"$regex": "^old.*line$", "$options": "ims"}}),
        json!({"title": {"$regex": "école"}}),
        json!({"title": {"$regex": "\\d+ hack", "$options": ""}}),
        json!({"title": {"$regex": "hack # tag\n -night", "$options": "x"}}),
        json!({"external_url": {"$regex": "^https://[[:alpha:]]+\\.example/"}}),
        json!({"dates.end_date": {"$lt": "2026-01-01"}}),
        json!({"dates.end_date": {"$gte": "2026-09-01T00:00:00Z"}}),
        json!({"dates.end_date": "2026-11-03T19:00:00+01:00"}),
        json!({"dates.start_date": {"$gte": "a"}}),
        json!({"title": {"$gte": "2026-01-01"}}),
        json!({"prize_pool": {"$gte": 1}}),
        json!({"prize_pool": {"$lt": 1}}),
        json!({"prize_pool": 5000.0}),
        json!({"is_active": {"$gte": true}}),
        json!({"type": {"$in": ["hackathon", "workshop"]}}),
        json!({"skills_required": {"$in": ["Go", "Haskell"]}}),
        json!({"skills_required": {"$in": [{"$regex": "^machine"}]}}),
        json!({"source.source_id": {"$in": [null, "old-1"]}}),
        json!({"is_active": true, "$or": [{"source.source_id": "nope"}, {"location.city": {"$regex": "berlin"}}]}),
        json!({"$or": [{"external_url": "https://old.example"}, {"title": "HackX", "source.platform": "MLH"}]}),
    ]
}

async fn keys(coll: &dyn DocumentCollection, filter: &Filter, sort: &Sort) -> Vec<String> {
    let options = FindOptions::default().with_sort(sort.clone());
    coll.find(filter, &options)
        .await
        .expect("find")
        .items
        .iter()
        .map(|d| d["key"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn file_and_postgres_select_the_same_records() {
    let Ok(url) = std::env::var("OPCAT_TEST_DATABASE_URL") else {
        eprintln!("OPCAT_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let collection = format!("equivalence_{}", uuid::Uuid::new_v4().simple());
    let pg = PgCollection::connect(&url, collection).await.expect("connect");
    pg.migrate().await.expect("migrate");

    let dir = tempfile::tempdir().expect("tempdir");
    let file = FileCollection::new(dir.path().join("opportunities.json"));
    for doc in corpus() {
        file.create(doc.clone()).await.expect("file create");
        pg.create(doc).await.expect("pg create");
    }

    for raw in filters() {
        let filter = Filter::from_json(&raw).expect("filter");
        let sort = Sort::new();
        assert_eq!(
            keys(&file, &filter, &sort).await,
            keys(&pg, &filter, &sort).await,
            "filter {raw}"
        );
        assert_eq!(
            file.count(&filter).await.expect("count"),
            pg.count(&filter).await.expect("count"),
            "count {raw}"
        );
    }

    for spec in ["dates.end_date:asc", "dates.start_date:desc,title", "prize_pool:desc", "source.source_id"] {
        let sort = Sort::parse(spec).expect("sort");
        assert_eq!(
            keys(&file, &Filter::new(), &sort).await,
            keys(&pg, &Filter::new(), &sort).await,
            "sort {spec}"
        );
    }

    let sweep = Filter::from_json(&json!({"is_active": true, "dates.end_date": {"$lt": "2026-10-01"}}))
        .expect("filter");
    let patch = json!({"is_active": false});
    assert_eq!(
        file.update_many(&sweep, patch.clone()).await.expect("file update_many"),
        pg.update_many(&sweep, patch).await.expect("pg update_many")
    );
    sqlx::query("DELETE FROM documents WHERE collection = $1")
        .bind(pg.collection())
        .execute(pg.pool())
        .await
        .expect("cleanup");
}
