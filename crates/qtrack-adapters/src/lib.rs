//! Source adapter contracts + the Historic JOA and Search API adapters.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use qtrack_core::SourceKind;
use qtrack_storage::{FetchError, FetchRequest, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod merge;

pub use merge::{FieldMap, MergeError, MergeOutcome, SchemaMerger, CURRENT_FIELD_MAP};

pub const CRATE_NAME: &str = "qtrack-adapters";

/// The Search API only looks back this many days.
pub const SEARCH_MAX_DAYS_BACK: i64 = 60;

pub type JsonMap = serde_json::Map<String, JsonValue>;

/// One upstream record, tagged with the schema it arrived in.
///
/// `Unusable` carries a page item that is not a JSON object; the merger drops
/// and counts it like any other record it cannot key.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Historical(JsonMap),
    Current(JsonMap),
    Unusable { source: SourceKind, value: JsonValue },
}

impl RawRecord {
    pub fn source(&self) -> SourceKind {
        match self {
            RawRecord::Historical(_) => SourceKind::Historical,
            RawRecord::Current(_) => SourceKind::Current,
            RawRecord::Unusable { source, .. } => *source,
        }
    }

    pub fn fields(&self) -> Option<&JsonMap> {
        match self {
            RawRecord::Historical(map) | RawRecord::Current(map) => Some(map),
            RawRecord::Unusable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }

    /// UTC calendar date of the fetch, the same clock the CLI defaults use.
    pub fn today(&self) -> NaiveDate {
        self.fetched_at.date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("transient upstream error: {0}")]
    Transient(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient { .. } => AdapterError::Transient(err.to_string()),
            FetchError::Auth { .. } => AdapterError::Auth(err.to_string()),
            FetchError::Rejected { .. } | FetchError::Request(_) => {
                AdapterError::Malformed(err.to_string())
            }
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceKind;

    /// Every raw record the upstream holds for `date`.
    async fn fetch(
        &self,
        ctx: &AdapterContext,
        date: NaiveDate,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

/// Where and how to page through one upstream API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEndpoint {
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_page_size() -> u32 {
    500
}

fn default_max_pages() -> u32 {
    200
}

impl SourceEndpoint {
    pub fn usajobs_default() -> Self {
        Self {
            base_url: "https://data.usajobs.gov".to_string(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/// Search API key plus the contact address USAJobs asks callers to send.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential {
    token: String,
    user_agent: String,
}

impl ApiCredential {
    pub fn new(token: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_agent: user_agent.into(),
        }
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("token", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalPage {
    pub items: Vec<JsonMap>,
    /// `data` entries that were not objects.
    pub skipped: Vec<JsonValue>,
    pub next: Option<String>,
}

/// Parse one `historicjoa` response: `{ "paging": { "next": ... }, "data": [...] }`.
pub fn parse_historical_page(body: &[u8]) -> Result<HistoricalPage, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Malformed(format!("historicjoa body is not JSON: {e}")))?;
    let data = value
        .get("data")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Malformed("historicjoa body has no `data` array".to_string()))?;

    let (items, skipped) = split_objects(data, "historicjoa");
    let next = value
        .pointer("/paging/next")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);

    Ok(HistoricalPage {
        items,
        skipped,
        next,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurrentPage {
    pub items: Vec<JsonMap>,
    pub skipped: Vec<JsonValue>,
    pub number_of_pages: u32,
}

/// Parse one Search response: `{ "SearchResult": { "SearchResultItems": [...], "UserArea": {...} } }`.
pub fn parse_current_page(body: &[u8]) -> Result<CurrentPage, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Malformed(format!("search body is not JSON: {e}")))?;
    let result = value
        .get("SearchResult")
        .ok_or_else(|| AdapterError::Malformed("search body has no `SearchResult`".to_string()))?;
    let data = result
        .get("SearchResultItems")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            AdapterError::Malformed("search body has no `SearchResultItems` array".to_string())
        })?;

    let number_of_pages = result
        .pointer("/UserArea/NumberOfPages")
        .and_then(|v| match v {
            JsonValue::String(s) => s.trim().parse::<u32>().ok(),
            other => other.as_u64().map(|n| n as u32),
        })
        .unwrap_or(1)
        .max(1);

    let (items, skipped) = split_objects(data, "search");
    Ok(CurrentPage {
        items,
        skipped,
        number_of_pages,
    })
}

fn split_objects(items: &[JsonValue], label: &str) -> (Vec<JsonMap>, Vec<JsonValue>) {
    let mut objects = Vec::with_capacity(items.len());
    let mut skipped = Vec::new();
    for item in items {
        match item {
            JsonValue::Object(map) => objects.push(map.clone()),
            other => {
                warn!(api = label, value = %other, "skipping non-object item");
                skipped.push(other.clone());
            }
        }
    }
    (objects, skipped)
}

fn unusable(source: SourceKind, skipped: Vec<JsonValue>) -> impl Iterator<Item = RawRecord> {
    skipped
        .into_iter()
        .map(move |value| RawRecord::Unusable { source, value })
}

/// Calendar date a Search item was published, read from `PublicationStartDate`.
pub fn publication_date(item: &JsonMap) -> Option<NaiveDate> {
    let raw = item
        .get("MatchedObjectDescriptor")?
        .get("PublicationStartDate")?
        .as_str()?;
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}

/// Adapter for the Historic JOA API (no credential needed).
#[derive(Debug, Clone)]
pub struct HistoricalAdapter {
    http: Arc<HttpFetcher>,
    endpoint: SourceEndpoint,
}

impl HistoricalAdapter {
    pub fn new(http: Arc<HttpFetcher>, endpoint: SourceEndpoint) -> Self {
        Self { http, endpoint }
    }

    pub fn first_page_url(&self, date: NaiveDate) -> String {
        let day = date.format("%Y-%m-%d");
        format!(
            "{}/api/historicjoa?StartPositionOpenDate={day}&EndPositionOpenDate={day}&PageSize={}",
            self.endpoint.base(),
            self.endpoint.page_size
        )
    }

    /// `paging.next` is usually a path relative to the API host.
    pub fn resolve_next(&self, next: &str) -> String {
        if next.starts_with("http://") || next.starts_with("https://") {
            next.to_string()
        } else {
            format!("{}/{}", self.endpoint.base(), next.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl SourceAdapter for HistoricalAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Historical
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        date: NaiveDate,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let mut url = self.first_page_url(date);
        let mut records = Vec::new();

        for page_no in 1..=self.endpoint.max_pages {
            let resp = self
                .http
                .fetch(ctx.run_id, SourceKind::Historical, &FetchRequest::get(&url))
                .await?;
            let page = parse_historical_page(&resp.body)?;
            debug!(%date, page_no, items = page.items.len(), "historicjoa page");
            records.extend(page.items.into_iter().map(RawRecord::Historical));
            records.extend(unusable(SourceKind::Historical, page.skipped));

            match page.next {
                Some(next) => url = self.resolve_next(&next),
                None => return Ok(records),
            }
        }

        Err(AdapterError::Malformed(format!(
            "historicjoa paging for {date} did not finish within {} pages",
            self.endpoint.max_pages
        )))
    }
}

/// Adapter for the Search API (current announcements, credential required).
#[derive(Debug, Clone)]
pub struct CurrentAdapter {
    http: Arc<HttpFetcher>,
    endpoint: SourceEndpoint,
    credential: ApiCredential,
}

impl CurrentAdapter {
    pub fn new(http: Arc<HttpFetcher>, endpoint: SourceEndpoint, credential: ApiCredential) -> Self {
        Self {
            http,
            endpoint,
            credential,
        }
    }

    /// `DatePosted` value covering `date` as seen from `today`.
    pub fn days_back(today: NaiveDate, date: NaiveDate) -> Result<i64, AdapterError> {
        let days = (today - date).num_days();
        if days < 0 {
            return Err(AdapterError::Malformed(format!(
                "{date} is in the future relative to {today}"
            )));
        }
        if days > SEARCH_MAX_DAYS_BACK {
            return Err(AdapterError::Malformed(format!(
                "{date} is outside the search API's {SEARCH_MAX_DAYS_BACK}-day window"
            )));
        }
        Ok(days)
    }

    pub fn page_request(&self, days_back: i64, page: u32) -> FetchRequest {
        FetchRequest::get(format!(
            "{}/api/Search?DatePosted={days_back}&ResultsPerPage={}&Page={page}",
            self.endpoint.base(),
            self.endpoint.page_size
        ))
        .header("Authorization-Key", self.credential.token.clone())
        .header("User-Agent", self.credential.user_agent.clone())
    }
}

#[async_trait]
impl SourceAdapter for CurrentAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Current
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        date: NaiveDate,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let days_back = Self::days_back(ctx.today(), date)?;
        let mut records = Vec::new();
        let mut page_no = 1u32;

        loop {
            let resp = self
                .http
                .fetch(ctx.run_id, SourceKind::Current, &self.page_request(days_back, page_no))
                .await?;
            let page = parse_current_page(&resp.body)?;
            let total = page.number_of_pages;
            records.extend(
                page.items
                    .into_iter()
                    .filter(|item| publication_date(item) == Some(date))
                    .map(RawRecord::Current),
            );
            // unreadable items carry no publication date; count them against this date
            records.extend(unusable(SourceKind::Current, page.skipped));
            debug!(%date, page_no, total, kept = records.len(), "search page");

            if page_no >= total {
                return Ok(records);
            }
            if page_no >= self.endpoint.max_pages {
                return Err(AdapterError::Malformed(format!(
                    "search paging for {date} reports {total} pages, above the {} page cap",
                    self.endpoint.max_pages
                )));
            }
            page_no += 1;
        }
    }
}
