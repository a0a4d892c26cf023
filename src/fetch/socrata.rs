// src/fetch/socrata.rs

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use super::{Record, RecordSource};
use crate::config::Settings;

/// Longest slice of an error body quoted back in the error message.
const BODY_SNIPPET: usize = 300;

/// Longest pause between two attempts, however many retries are configured.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Paginated client for a Socrata (SODA) resource such as `data.cdc.gov/resource/dttw-5yxu.json`.
pub struct SocrataClient {
    client: Client,
    base: Url,
    app_token: Option<String>,
    filters: BTreeMap<String, String>,
    max_attempts: usize,
    retry_delay: Duration,
}

/// Outcome of a failed attempt: worth another try, or not.
enum Failure {
    Transient(anyhow::Error),
    Fatal(anyhow::Error),
}

impl SocrataClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let base = Url::parse(&settings.api_url)
            .with_context(|| format!("parsing API URL {}", settings.api_url))?;
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .gzip(true)
            .user_agent(concat!("brfss-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;

        let mut filters = settings.filters.clone();
        // Socrata gives no ordering guarantee across pages unless asked for one.
        filters
            .entry("$order".to_string())
            .or_insert_with(|| ":id".to_string());

        Ok(Self {
            client,
            base,
            app_token: settings.app_token.clone(),
            filters,
            max_attempts: settings.max_retries.max(1),
            retry_delay: settings.retry_delay(),
        })
    }

    /// Resource URL with paging and filter params for one page.
    pub fn page_url(&self, offset: usize, limit: usize) -> Url {
        let mut url = self.base.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("$limit", &limit.to_string());
            q.append_pair("$offset", &offset.to_string());
            for (k, v) in &self.filters {
                q.append_pair(k, v);
            }
        }
        url
    }

    async fn attempt(&self, url: &Url) -> Result<Vec<Record>, Failure> {
        let mut req = self.client.get(url.clone());
        if let Some(token) = &self.app_token {
            req = req.header("X-App-Token", token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Failure::Transient(anyhow!(e).context("sending request")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = anyhow!("HTTP {}: {}", status, snippet(&body));
            return Err(if is_retryable(status) {
                Failure::Transient(err)
            } else {
                Failure::Fatal(err)
            });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Failure::Transient(anyhow!(e).context("reading response body")))?;

        parse_records(&bytes).map_err(Failure::Fatal)
    }
}

#[async_trait]
impl RecordSource for SocrataClient {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Record>> {
        let url = self.page_url(offset, limit);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(%url, attempt, "GET page");

            match self.attempt(&url).await {
                Ok(records) => return Ok(records),
                Err(Failure::Transient(e)) if attempt < self.max_attempts => {
                    let delay = backoff_delay(self.retry_delay, attempt);
                    warn!(offset, attempt, ?delay, error = %e, "page request failed, retrying");
                    sleep(delay).await;
                }
                Err(Failure::Transient(e)) | Err(Failure::Fatal(e)) => {
                    return Err(e.context(format!(
                        "fetching offset {} from {} (attempt {}/{})",
                        offset, self.base, attempt, self.max_attempts
                    )));
                }
            }
        }
    }

    fn describe(&self) -> String {
        self.base.to_string()
    }
}

/// Rate limiting, gateway trouble and server errors are worth retrying.
pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Pause before retry number `attempt` (1-based): `base`, doubled per attempt, capped.
pub fn backoff_delay(base: Duration, attempt: usize) -> Duration {
    let factor = u32::try_from(attempt.saturating_sub(1))
        .ok()
        .and_then(|n| 2u32.checked_pow(n))
        .unwrap_or(u32::MAX);
    base.checked_mul(factor)
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

/// Decode a SODA response body: a JSON array of objects.
pub fn parse_records(body: &[u8]) -> Result<Vec<Record>> {
    let value: Value = serde_json::from_slice(body).context("response is not valid JSON")?;
    let Value::Array(items) = value else {
        bail!("expected a JSON array of records, got {}", kind(&value));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            other => Err(anyhow!("record {} is {}, not an object", i, kind(&other))),
        })
        .collect()
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(BODY_SNIPPET) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
