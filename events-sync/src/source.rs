use std::{collections::BTreeMap, fs, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::config::ApiConfig;

/// Query filters sent with every list request (besides `page` / `per_page`).
pub type Filters = BTreeMap<String, String>;

/// Upstream error code signalling a request timeout.
const TIMEOUT_ERROR_CODE: i64 = 1000;

/// A single event record as returned by the upstream list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub id: i64,
    pub name: String,
    pub occurs_at: DateTime<Utc>,
    pub venue: IdRef,
    pub category: IdRef,
    #[serde(default)]
    pub configuration: Option<OptionalIdRef>,
    #[serde(default)]
    pub products_count: i64,
    pub url: String,
    pub updated_at: DateTime<Utc>,
    pub state: String,
    #[serde(default)]
    pub performances: Vec<RawPerformance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdRef {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionalIdRef {
    #[serde(default)]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPerformance {
    #[serde(default)]
    pub performer: Option<OptionalIdRef>,
    #[serde(default)]
    pub primary: bool,
}

/// One page of upstream records plus the total page count for the whole query.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<RawEvent>,
    pub total_pages: u32,
}

/// Wire shape of the list endpoint response.
#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    per_page: u64,
    #[serde(default)]
    total_entries: u64,
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<JsonValue>,
}

/// Failure classes of a page fetch. Only `Timeout` is transient.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("upstream rejected credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error("upstream rate limit exceeded")]
    RateLimited,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("page {page} still timing out after {attempts} attempts")]
    RetriesExhausted { page: u32, attempts: u32 },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout)
    }
}

/// Capability yielding pages of upstream event records.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn list_page(&self, filters: &Filters, page: u32) -> Result<Page, FetchError>;
}

/// Build the page source selected by config: a recorded JSON file or the HTTP API.
pub fn page_source_from_config(cfg: &ApiConfig) -> Result<Box<dyn PageSource>> {
    if let Some(path) = &cfg.file {
        return Ok(Box::new(FilePageSource::load(path)?));
    }
    Ok(Box::new(HttpPageSource::from_config(cfg)?))
}

/// Parse a list response body into a `Page`.
///
/// The total page count is derived from `total_entries` and `per_page`, so every
/// page of the same query reports the same value.
pub fn parse_list_response(body: &str) -> Result<Page, FetchError> {
    let resp: ListResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
    page_from_response(resp)
}

fn page_from_response(resp: ListResponse) -> Result<Page, FetchError> {
    let total_pages = if resp.per_page == 0 {
        0
    } else {
        resp.total_entries.div_ceil(resp.per_page)
    };
    let total_pages = u32::try_from(total_pages)
        .map_err(|_| FetchError::Malformed(format!("total page count {total_pages} out of range")))?;

    Ok(Page {
        records: resp.events,
        total_pages,
    })
}

fn is_timeout_code(code: &JsonValue) -> bool {
    match code {
        JsonValue::Number(n) => n.as_i64() == Some(TIMEOUT_ERROR_CODE),
        JsonValue::String(s) => s.trim() == TIMEOUT_ERROR_CODE.to_string(),
        _ => false,
    }
}

/// Classify a non-success HTTP response.
fn classify_error_response(status: StatusCode, body: &str) -> FetchError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();

    if let Some(code) = parsed.as_ref().and_then(|b| b.code.as_ref()) {
        if is_timeout_code(code) {
            return FetchError::Timeout;
        }
    }

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FetchError::Timeout,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FetchError::Unauthorized(status.as_u16())
        }
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited,
        _ => FetchError::Status {
            status: status.as_u16(),
            message: parsed
                .and_then(|b| b.error)
                .unwrap_or_else(|| body.chars().take(200).collect()),
        },
    }
}

/// Page source backed by the upstream HTTP API.
pub struct HttpPageSource {
    client: Client,
    endpoint: String,
    token: Option<String>,
    per_page: u32,
}

impl HttpPageSource {
    pub fn from_config(cfg: &ApiConfig) -> Result<Self> {
        let base_url = cfg
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow!("api.base_url is required for the HTTP page source"))?;

        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/events", base_url.trim_end_matches('/')),
            token: cfg.token.clone(),
            per_page: cfg.per_page,
        })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn list_page(&self, filters: &Filters, page: u32) -> Result<Page, FetchError> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .header(header::ACCEPT, "application/json")
            .query(filters)
            .query(&[("page", page), ("per_page", self.per_page)]);

        if let Some(token) = &self.token {
            request = request.header("X-Token", token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        if !status.is_success() {
            return Err(classify_error_response(status, &body));
        }

        parse_list_response(&body)
    }
}

/// Page source replaying list responses recorded in a local JSON file.
///
/// The file holds a JSON array whose N-th element is the response for page N+1.
/// Pages past the end of the array come back empty. Filters are ignored.
pub struct FilePageSource {
    pages: Vec<JsonValue>,
}

impl FilePageSource {
    pub fn load(path: &str) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read page file {}", path))?;
        let value: JsonValue = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse JSON array from {}", path))?;
        let pages = value
            .as_array()
            .cloned()
            .ok_or_else(|| anyhow!("Expected JSON array of list responses in file {}", path))?;
        Ok(Self { pages })
    }
}

#[async_trait]
impl PageSource for FilePageSource {
    async fn list_page(&self, _filters: &Filters, page: u32) -> Result<Page, FetchError> {
        let idx = page.saturating_sub(1) as usize;
        let Some(value) = self.pages.get(idx) else {
            let total_pages = u32::try_from(self.pages.len()).unwrap_or(u32::MAX);
            return Ok(Page {
                records: Vec::new(),
                total_pages,
            });
        };

        let resp: ListResponse = serde_json::from_value(value.clone())
            .map_err(|e| FetchError::Malformed(format!("page {page}: {e}")))?;
        page_from_response(resp)
    }
}
