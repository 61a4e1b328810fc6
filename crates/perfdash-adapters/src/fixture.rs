//! Offline page source backed by recorded upstream responses.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{AdapterContext, AdapterError, Endpoint, Page, PageSize, PageSource};

/// Serves `prospections.json` and `leads.json` from a directory through the paging contract.
///
/// Each file holds either a bare JSON array or an upstream-shaped `{ "data": [...] }` body.
#[derive(Debug, Clone, Default)]
pub struct FixturePageSource {
    collections: BTreeMap<Endpoint, Vec<JsonValue>>,
}

impl FixturePageSource {
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut collections = BTreeMap::new();
        for (endpoint, file) in [
            (Endpoint::Prospections, "prospections.json"),
            (Endpoint::Leads, "leads.json"),
        ] {
            let path = dir.join(file);
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let body: JsonValue = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            let records = match body {
                JsonValue::Array(items) => items,
                other => Page::from_body(&other)
                    .with_context(|| format!("reading records from {}", path.display()))?
                    .records,
            };
            collections.insert(endpoint, records);
        }
        Ok(Self { collections })
    }

    pub fn from_records(prospections: Vec<JsonValue>, leads: Vec<JsonValue>) -> Self {
        Self {
            collections: BTreeMap::from([
                (Endpoint::Prospections, prospections),
                (Endpoint::Leads, leads),
            ]),
        }
    }

    pub fn len(&self, endpoint: Endpoint) -> usize {
        self.collections.get(&endpoint).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.collections.values().all(Vec::is_empty)
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    fn source_id(&self) -> &'static str {
        "gs-engage-fixture"
    }

    async fn fetch_page(
        &self,
        _ctx: &AdapterContext,
        endpoint: Endpoint,
        page: u32,
        page_size: PageSize,
    ) -> Result<Page, AdapterError> {
        if page == 0 {
            return Err(AdapterError::Rejected {
                status: 400,
                message: "validation error: page must be >= 1".to_string(),
            });
        }
        let all = self
            .collections
            .get(&endpoint)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let size = page_size.get() as usize;
        let total_pages = all.len().div_ceil(size).max(1) as u32;
        let start = (page as usize - 1) * size;
        let records = all.iter().skip(start).take(size).cloned().collect();
        Ok(Page {
            records,
            total_pages: Some(total_pages),
        })
    }
}
