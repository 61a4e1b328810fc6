//! GS Engage (Growthstation) list-endpoint client.

use async_trait::async_trait;
use perfdash_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;

use crate::{AdapterContext, AdapterError, Endpoint, Page, PageSize, PageSource};

/// Where the upstream lives and how to authenticate. Both fields are mandatory.
#[derive(Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GsEngageClient {
    http: HttpFetcher,
    config: UpstreamConfig,
}

impl GsEngageClient {
    pub fn new(http: HttpFetcher, config: UpstreamConfig) -> Self {
        Self { http, config }
    }

    fn endpoint_url(&self, endpoint: Endpoint) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.path()
        )
    }
}

/// Turns an upstream error body into something an operator can act on.
pub fn upstream_error_message(status: u16, body: &str) -> String {
    let parsed = serde_json::from_str::<JsonValue>(body).ok();

    if let Some(JsonValue::Array(issues)) = parsed.as_ref().and_then(|v| v.get("query")) {
        let mentions_limit = |issue: &JsonValue| match issue.get("path") {
            Some(JsonValue::Array(parts)) => parts.iter().any(|p| p.as_str() == Some("limit")),
            Some(JsonValue::String(path)) => path.contains("limit"),
            _ => false,
        };
        if let Some(limit_issue) = issues.iter().find(|issue| mentions_limit(issue)) {
            let detail = limit_issue
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("must be <= 100");
            return format!("invalid 'limit' parameter: {detail}");
        }
        let messages = issues
            .iter()
            .filter_map(|issue| issue.get("message").and_then(JsonValue::as_str))
            .collect::<Vec<_>>();
        if !messages.is_empty() {
            return format!("validation error: {}", messages.join(", "));
        }
    }

    if let Some(message) = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(JsonValue::as_str)
    {
        return message.to_string();
    }

    if let Some(message) = parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(JsonValue::as_str)
    {
        return message.to_string();
    }

    match parsed {
        Some(JsonValue::String(text)) if !text.trim().is_empty() => text,
        None if !body.trim().is_empty() => body.trim().to_string(),
        _ => format!("API returned {status}"),
    }
}

fn adapter_error_from_fetch(err: FetchError) -> AdapterError {
    match err {
        FetchError::HttpStatus { status, body, .. } if (400..500).contains(&status) => {
            AdapterError::Rejected {
                message: upstream_error_message(status, &body),
                status,
            }
        }
        FetchError::HttpStatus { status, url, .. } => {
            AdapterError::Unavailable(format!("http status {status} for {url}"))
        }
        err if err.is_timeout() => AdapterError::Unavailable("request timed out".to_string()),
        err => AdapterError::Unavailable(err.to_string()),
    }
}

#[async_trait]
impl PageSource for GsEngageClient {
    fn source_id(&self) -> &'static str {
        "gs-engage"
    }

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        endpoint: Endpoint,
        page: u32,
        page_size: PageSize,
    ) -> Result<Page, AdapterError> {
        let url = self.endpoint_url(endpoint);
        let query = [
            ("limit", page_size.get().to_string()),
            ("page", page.to_string()),
            ("apiKey", self.config.api_key.clone()),
        ];
        let response = self
            .http
            .get(ctx.run_id, self.source_id(), &url, &query)
            .await
            .map_err(adapter_error_from_fetch)?;

        let body: JsonValue = serde_json::from_slice(&response.body).map_err(|err| {
            AdapterError::Malformed(format!("{} page {page}: {err}", endpoint.path()))
        })?;
        Page::from_body(&body)
    }
}
