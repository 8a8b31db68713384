//! Feed client: GET a JSON feed with bounded retries and split it into records.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

use crate::{parse_feed, AdapterError, FetchContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Wait before the next attempt: the server's `Retry-After` when it sent
    /// one, else exponential backoff. Never longer than `max_delay`.
    fn wait(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .map(|hint| hint.min(self.max_delay))
            .unwrap_or_else(|| self.backoff(attempt))
    }
}

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("requesting {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered http {status}")]
    Status { url: String, status: u16 },
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

/// `Retry-After` as either delay seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone)]
pub struct FeedClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl FeedClient {
    pub fn new(config: FeedClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building feed http client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_feed(
        &self,
        ctx: &FetchContext,
        platform: &str,
        url: &str,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let span = info_span!("feed_fetch", run_id = %ctx.run_id, platform, url);
        async {
            let (final_url, body) = self.get_with_retries(url).await?;
            let records = parse_feed(&final_url, &body)?;
            debug!(bytes = body.len(), records = records.len(), "feed parsed");
            Ok::<_, AdapterError>(records)
        }
        .instrument(span)
        .await
    }

    async fn get_with_retries(&self, url: &str) -> Result<(String, Vec<u8>), FetchError> {
        let mut attempt = 0;
        loop {
            let (err, hint) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await.map_err(|source| FetchError::Transport {
                        url: final_url.clone(),
                        source,
                    })?;
                    return Ok((final_url, body.to_vec()));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::Status {
                        url: resp.url().to_string(),
                        status: status.as_u16(),
                    };
                    if !is_transient(status) {
                        return Err(err);
                    }
                    let hint = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| parse_retry_after(value, Utc::now()));
                    (err, hint)
                }
                Err(source) => {
                    let transient = source.is_timeout() || source.is_connect();
                    let err = FetchError::Transport {
                        url: url.to_string(),
                        source,
                    };
                    if !transient {
                        return Err(err);
                    }
                    (err, None)
                }
            };

            if attempt >= self.retry.max_retries {
                return Err(err);
            }
            let wait = self.retry.wait(attempt, hint);
            warn!(error = %err, attempt, wait_ms = wait.as_millis() as u64, "retrying feed request");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}
