//! Upstream CRM adapter contracts, pagination policy and GS Engage implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use perfdash_core::{Lead, Prospection};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

mod fixture;
mod gs_engage;
mod records;

pub use fixture::FixturePageSource;
pub use gs_engage::{upstream_error_message, GsEngageClient, UpstreamConfig};
pub use records::{is_truthy, parse_leads, parse_prospections, parse_timestamp, Parsed};

pub const CRATE_NAME: &str = "perfdash-adapters";

/// Hard cap the upstream enforces on `limit`.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Prospections,
    Leads,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Prospections => "/prospections",
            Self::Leads => "/leads",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSize(u32);

impl PageSize {
    pub fn new(size: u32) -> Option<Self> {
        (1..=MAX_PAGE_SIZE).contains(&size).then_some(Self(size))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self(MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationPolicy {
    pub page_size: PageSize,
    pub max_pages: u32,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            page_size: PageSize::default(),
            max_pages: 20,
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
}

/// One page of a list endpoint: `{ data: [...], meta?: { totalPages } }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<JsonValue>,
    pub total_pages: Option<u32>,
}

impl Page {
    pub fn from_body(body: &JsonValue) -> Result<Self, AdapterError> {
        let records = match body.get("data") {
            Some(JsonValue::Array(items)) => items.clone(),
            Some(JsonValue::Null) | None => Vec::new(),
            Some(other) => {
                return Err(AdapterError::Malformed(format!(
                    "expected `data` to be an array, got {}",
                    json_kind(other)
                )))
            }
        };
        let total_pages = body
            .get("meta")
            .and_then(|meta| meta.get("totalPages"))
            .map(perfdash_core::lenient_number)
            .filter(|n| *n >= 1.0)
            .map(|n| n as u32);
        Ok(Self {
            records,
            total_pages,
        })
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The upstream answered with a 4xx; `message` is already human readable.
    #[error("upstream rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait PageSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        endpoint: Endpoint,
        page: u32,
        page_size: PageSize,
    ) -> Result<Page, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EmptyPage,
    LastDeclaredPage,
    PageBound,
    BadRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Collected {
    pub records: Vec<JsonValue>,
    pub pages_fetched: u32,
    pub stop: StopReason,
}

/// Walks `endpoint` page by page until an empty page, the declared last page, the page bound,
/// or a 400 response after at least one page. A 400 on the first page and any other failure
/// propagate.
pub async fn fetch_all_pages(
    source: &dyn PageSource,
    ctx: &AdapterContext,
    endpoint: Endpoint,
    policy: PaginationPolicy,
) -> Result<Collected, AdapterError> {
    let mut records = Vec::new();
    let mut pages_fetched = 0u32;
    let mut page = 1u32;

    while page <= policy.max_pages {
        let fetched = match source
            .fetch_page(ctx, endpoint, page, policy.page_size)
            .await
        {
            Ok(fetched) => fetched,
            Err(AdapterError::Rejected { status: 400, message }) if pages_fetched > 0 => {
                warn!(
                    source_id = source.source_id(),
                    ?endpoint,
                    page,
                    %message,
                    "400 during pagination; keeping {} records collected so far",
                    records.len()
                );
                return Ok(Collected {
                    records,
                    pages_fetched,
                    stop: StopReason::BadRequest,
                });
            }
            Err(err) => return Err(err),
        };

        if fetched.records.is_empty() {
            return Ok(Collected {
                records,
                pages_fetched,
                stop: StopReason::EmptyPage,
            });
        }

        pages_fetched += 1;
        records.extend(fetched.records);
        info!(
            source_id = source.source_id(),
            ?endpoint,
            page,
            total = records.len(),
            "fetched page"
        );

        if page >= fetched.total_pages.unwrap_or(1) {
            return Ok(Collected {
                records,
                pages_fetched,
                stop: StopReason::LastDeclaredPage,
            });
        }
        page += 1;
    }

    warn!(
        source_id = source.source_id(),
        ?endpoint,
        max_pages = policy.max_pages,
        "page bound reached; upstream may hold more records"
    );
    Ok(Collected {
        records,
        pages_fetched,
        stop: StopReason::PageBound,
    })
}

/// Both collections, fetched fully one after the other.
#[derive(Debug, Clone, Default)]
pub struct UpstreamSnapshot {
    pub prospections: Vec<Prospection>,
    pub leads: Vec<Lead>,
    pub pages_fetched: u32,
    pub malformed_records: usize,
}

pub async fn fetch_snapshot(
    source: &dyn PageSource,
    ctx: &AdapterContext,
    policy: PaginationPolicy,
) -> Result<UpstreamSnapshot, AdapterError> {
    let prospections = fetch_all_pages(source, ctx, Endpoint::Prospections, policy).await?;
    let leads = fetch_all_pages(source, ctx, Endpoint::Leads, policy).await?;

    let parsed_prospections = parse_prospections(prospections.records);
    let parsed_leads = parse_leads(leads.records);

    Ok(UpstreamSnapshot {
        pages_fetched: prospections.pages_fetched + leads.pages_fetched,
        malformed_records: parsed_prospections.malformed + parsed_leads.malformed,
        prospections: parsed_prospections.items,
        leads: parsed_leads.items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct ScriptedSource {
        pages: Mutex<VecDeque<Result<Page, AdapterError>>>,
        requested: Mutex<Vec<(Endpoint, u32, u32)>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<Page, AdapterError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        fn source_id(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_page(
            &self,
            _ctx: &AdapterContext,
            endpoint: Endpoint,
            page: u32,
            page_size: PageSize,
        ) -> Result<Page, AdapterError> {
            self.requested
                .lock()
                .await
                .push((endpoint, page, page_size.get()));
            self.pages
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(Page::default()))
        }
    }

    fn page(n: usize, total_pages: Option<u32>) -> Result<Page, AdapterError> {
        Ok(Page {
            records: (0..n).map(|i| json!({ "id": i })).collect(),
            total_pages,
        })
    }

    fn ctx() -> AdapterContext {
        AdapterContext::new(Uuid::new_v4())
    }

    #[tokio::test]
    async fn stops_at_declared_last_page() {
        let source =
            ScriptedSource::new(vec![page(100, Some(2)), page(40, Some(2)), page(5, None)]);
        let policy = PaginationPolicy::default();
        let collected = fetch_all_pages(&source, &ctx(), Endpoint::Leads, policy)
            .await
            .unwrap();
        assert_eq!(collected.records.len(), 140);
        assert_eq!(collected.pages_fetched, 2);
        assert_eq!(collected.stop, StopReason::LastDeclaredPage);

        let requested = source.requested.lock().await.clone();
        assert_eq!(
            requested,
            vec![(Endpoint::Leads, 1, 100), (Endpoint::Leads, 2, 100)]
        );
    }

    #[tokio::test]
    async fn missing_meta_means_single_page() {
        let source = ScriptedSource::new(vec![page(3, None), page(3, None)]);
        let policy = PaginationPolicy::default();
        let collected = fetch_all_pages(&source, &ctx(), Endpoint::Leads, policy)
            .await
            .unwrap();
        assert_eq!(collected.records.len(), 3);
        assert_eq!(collected.stop, StopReason::LastDeclaredPage);
    }

    #[tokio::test]
    async fn stops_on_empty_page() {
        let source = ScriptedSource::new(vec![page(2, Some(9)), page(0, Some(9))]);
        let policy = PaginationPolicy::default();
        let collected = fetch_all_pages(&source, &ctx(), Endpoint::Prospections, policy)
            .await
            .unwrap();
        assert_eq!(collected.records.len(), 2);
        assert_eq!(collected.stop, StopReason::EmptyPage);
    }

    #[tokio::test]
    async fn page_bound_caps_the_walk() {
        let source = ScriptedSource::new((0..10).map(|_| page(1, Some(50))).collect());
        let policy = PaginationPolicy {
            page_size: PageSize::new(1).unwrap(),
            max_pages: 3,
        };
        let collected = fetch_all_pages(&source, &ctx(), Endpoint::Prospections, policy)
            .await
            .unwrap();
        assert_eq!(collected.records.len(), 3);
        assert_eq!(collected.stop, StopReason::PageBound);
    }

    #[tokio::test]
    async fn bad_request_keeps_collected_records() {
        let source = ScriptedSource::new(vec![
            page(100, Some(5)),
            Err(AdapterError::Rejected {
                status: 400,
                message: "invalid page".into(),
            }),
        ]);
        let policy = PaginationPolicy::default();
        let collected = fetch_all_pages(&source, &ctx(), Endpoint::Prospections, policy)
            .await
            .unwrap();
        assert_eq!(collected.records.len(), 100);
        assert_eq!(collected.stop, StopReason::BadRequest);
    }

    #[tokio::test]
    async fn bad_request_on_first_page_is_an_error() {
        let source = ScriptedSource::new(vec![Err(AdapterError::Rejected {
            status: 400,
            message: "invalid 'limit' parameter: must be <= 100".into(),
        })]);
        let policy = PaginationPolicy::default();
        let err = fetch_all_pages(&source, &ctx(), Endpoint::Prospections, policy)
            .await
            .unwrap_err();
        match err {
            AdapterError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("'limit'"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_failures_propagate() {
        let source = ScriptedSource::new(vec![
            page(100, Some(5)),
            Err(AdapterError::Rejected {
                status: 401,
                message: "bad key".into(),
            }),
        ]);
        let policy = PaginationPolicy::default();
        let err = fetch_all_pages(&source, &ctx(), Endpoint::Prospections, policy)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Rejected { status: 401, .. }));

        let source = ScriptedSource::new(vec![Err(AdapterError::Unavailable("timed out".into()))]);
        let policy = PaginationPolicy::default();
        let err = fetch_all_pages(&source, &ctx(), Endpoint::Leads, policy)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable(_)));
    }

    #[test]
    fn page_size_is_capped_at_upstream_limit() {
        assert!(PageSize::new(0).is_none());
        assert!(PageSize::new(101).is_none());
        assert_eq!(PageSize::new(100).unwrap().get(), 100);
    }

    #[test]
    fn page_body_parsing_tolerates_missing_parts() {
        let body = json!({ "data": [{"id": 1}], "meta": {"totalPages": "3"} });
        let page = Page::from_body(&body).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.total_pages, Some(3));

        let empty = Page::from_body(&json!({})).unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.total_pages, None);

        assert!(Page::from_body(&json!({ "data": "nope" })).is_err());
    }
}
