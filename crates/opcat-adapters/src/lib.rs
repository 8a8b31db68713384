//! Sources of raw opportunity records. Records stay untyped JSON here.

pub mod http;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub use http::{FeedClient, FeedClientConfig, FetchError, RetryPolicy};

pub const CRATE_NAME: &str = "opcat-adapters";

const FALLBACK_SAMPLE: &str = include_str!("../fixtures/fallback_opportunities.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing feed {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("feed {origin} is neither an array nor an object with an `opportunities` or `data` array")]
    Shape { origin: String },
    #[error("source {0} has no feed_url or fixture_path configured")]
    NotConfigured(String),
}

#[async_trait]
pub trait OpportunitySource: Send + Sync {
    /// Upstream platform name as written to `source.platform`.
    fn platform(&self) -> &str;

    async fn fetch_opportunities(&self, ctx: &FetchContext) -> Result<Vec<JsonValue>, AdapterError>;
}

/// A bare array, or one wrapped under `opportunities` or `data`.
pub fn parse_feed(origin: &str, body: &[u8]) -> Result<Vec<JsonValue>, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body).map_err(|source| AdapterError::Parse {
        origin: origin.to_string(),
        source,
    })?;
    match value {
        JsonValue::Array(records) => Ok(records),
        JsonValue::Object(mut map) => {
            for key in ["opportunities", "data"] {
                if let Some(JsonValue::Array(records)) = map.remove(key) {
                    return Ok(records);
                }
            }
            Err(AdapterError::Shape {
                origin: origin.to_string(),
            })
        }
        _ => Err(AdapterError::Shape {
            origin: origin.to_string(),
        }),
    }
}

/// Bundled records for `platform`, else the whole sample restamped to it.
pub fn fallback_opportunities(platform: &str) -> Vec<JsonValue> {
    let records = match parse_feed("bundled fallback sample", FALLBACK_SAMPLE.as_bytes()) {
        Ok(records) => records,
        Err(_) => return Vec::new(),
    };
    let (own, others): (Vec<_>, Vec<_>) = records.into_iter().partition(|record| {
        record
            .pointer("/source/platform")
            .and_then(JsonValue::as_str)
            .is_some_and(|p| p.eq_ignore_ascii_case(platform))
    });
    if !own.is_empty() {
        return own;
    }
    others
        .into_iter()
        .map(|mut record| {
            if let Some(JsonValue::Object(source)) = record.get_mut("source") {
                source.insert("platform".to_string(), JsonValue::String(platform.to_string()));
            }
            record
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct JsonFeedSource {
    platform: String,
    url: String,
    client: Arc<FeedClient>,
}

impl JsonFeedSource {
    pub fn new(platform: impl Into<String>, url: impl Into<String>, client: Arc<FeedClient>) -> Self {
        Self {
            platform: platform.into(),
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl OpportunitySource for JsonFeedSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_opportunities(&self, ctx: &FetchContext) -> Result<Vec<JsonValue>, AdapterError> {
        let records = self.client.fetch_feed(ctx, &self.platform, &self.url).await?;
        info!(platform = %self.platform, url = %self.url, records = records.len(), "feed fetched");
        Ok(records)
    }
}

/// Feed captured to a local JSON file.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    platform: String,
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(platform: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            platform: platform.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl OpportunitySource for FixtureSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_opportunities(&self, _ctx: &FetchContext) -> Result<Vec<JsonValue>, AdapterError> {
        let origin = self.path.display().to_string();
        let body = tokio::fs::read(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: origin.clone(),
                source,
            })?;
        let records = parse_feed(&origin, &body)?;
        debug!(platform = %self.platform, path = %origin, records = records.len(), "fixture loaded");
        Ok(records)
    }
}

/// Also stands in for sources configured without any feed.
#[derive(Debug, Clone)]
pub struct StaticSource {
    platform: String,
    records: Option<Vec<JsonValue>>,
}

impl StaticSource {
    pub fn new(platform: impl Into<String>, records: Vec<JsonValue>) -> Self {
        Self {
            platform: platform.into(),
            records: Some(records),
        }
    }

    pub fn unconfigured(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            records: None,
        }
    }
}

#[async_trait]
impl OpportunitySource for StaticSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_opportunities(&self, _ctx: &FetchContext) -> Result<Vec<JsonValue>, AdapterError> {
        self.records
            .clone()
            .ok_or_else(|| AdapterError::NotConfigured(self.platform.clone()))
    }
}
