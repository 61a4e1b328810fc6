//! Environment-driven configuration for the sync pipeline.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use perfdash_adapters::{PageSize, PaginationPolicy, UpstreamConfig, MAX_PAGE_SIZE};
use thiserror::Error;

pub const DEFAULT_SYNC_CRON: &str = "0 */10 * * * *";
pub const DEFAULT_FALLBACK_LIMIT: usize = 100;
pub const DEFAULT_UPSERT_CHUNK: usize = 500;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Knobs the pipeline itself needs, independent of where they were read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub pagination: PaginationPolicy,
    pub upsert_chunk_size: usize,
    pub fallback_limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            pagination: PaginationPolicy::default(),
            upsert_chunk_size: DEFAULT_UPSERT_CHUNK,
            fallback_limit: DEFAULT_FALLBACK_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub pipeline: PipelineSettings,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub overrides_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = required(&lookup, "DATABASE_URL")?;

        let page_size = parsed(&lookup, "PERFDASH_PAGE_SIZE", MAX_PAGE_SIZE)?;
        let page_size = PageSize::new(page_size).ok_or_else(|| ConfigError::Invalid {
            name: "PERFDASH_PAGE_SIZE",
            value: page_size.to_string(),
            reason: format!("must be between 1 and {MAX_PAGE_SIZE}"),
        })?;
        let max_pages = parsed(&lookup, "PERFDASH_MAX_PAGES", 20u32)?;
        if max_pages == 0 {
            return Err(ConfigError::Invalid {
                name: "PERFDASH_MAX_PAGES",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        let upsert_chunk_size = parsed(&lookup, "PERFDASH_UPSERT_CHUNK", DEFAULT_UPSERT_CHUNK)?;
        if upsert_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                name: "PERFDASH_UPSERT_CHUNK",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            database_url,
            pipeline: PipelineSettings {
                pagination: PaginationPolicy {
                    page_size,
                    max_pages,
                },
                upsert_chunk_size,
                fallback_limit: parsed(
                    &lookup,
                    "PERFDASH_FALLBACK_LIMIT",
                    DEFAULT_FALLBACK_LIMIT,
                )?,
            },
            http_timeout: Duration::from_secs(parsed(
                &lookup,
                "PERFDASH_HTTP_TIMEOUT_SECS",
                30u64,
            )?),
            user_agent: optional(&lookup, "PERFDASH_USER_AGENT")
                .unwrap_or_else(|| concat!("perfdash/", env!("CARGO_PKG_VERSION")).to_string()),
            scheduler_enabled: flag(&lookup, "PERFDASH_SCHEDULER_ENABLED")?,
            sync_cron: optional(&lookup, "PERFDASH_SYNC_CRON")
                .unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            overrides_path: optional(&lookup, "PERFDASH_OVERRIDES_PATH").map(PathBuf::from),
        })
    }
}

pub fn upstream_config_from_env() -> Result<UpstreamConfig, ConfigError> {
    upstream_config_from_lookup(|name| std::env::var(name).ok())
}

pub fn upstream_config_from_lookup<F>(lookup: F) -> Result<UpstreamConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let base_url = required(&lookup, "GS_ENGAGE_API_URL")?;
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(ConfigError::Invalid {
            name: "GS_ENGAGE_API_URL",
            value: base_url,
            reason: "expected an http(s) URL".into(),
        });
    }
    Ok(UpstreamConfig {
        base_url,
        api_key: required(&lookup, "GS_ENGAGE_API_KEY")?,
    })
}

fn optional<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, name).ok_or(ConfigError::Missing(name))
}

fn parsed<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(lookup, name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
            value: raw,
        }),
    }
}

fn flag<F>(lookup: &F, name: &'static str) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match optional(lookup, name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            name,
            value: v,
            reason: "expected a boolean".into(),
        }),
    }
}
