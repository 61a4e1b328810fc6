//! Sync pipeline orchestration: fetch, aggregate, normalize, reconcile.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use perfdash_adapters::{
    fetch_snapshot, AdapterContext, AdapterError, GsEngageClient, PageSource, UpstreamConfig,
    UpstreamSnapshot,
};
use perfdash_core::{MetricOverrides, UserAggregate};
use perfdash_storage::{HttpClientConfig, HttpFetcher, PerformanceStore};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod aggregate;
mod config;
mod normalize;
mod reconcile;
mod summary;

pub use aggregate::{
    apply_overrides, AggregationReport, MetricAggregator, CALLS_PER_PROSPECTION,
    MAX_LEAD_TIME_HOURS, NO_SHOW_MARKERS,
};
pub use config::{
    upstream_config_from_env, upstream_config_from_lookup, ConfigError, PipelineSettings,
    SyncConfig, DEFAULT_FALLBACK_LIMIT, DEFAULT_SYNC_CRON, DEFAULT_UPSERT_CHUNK,
};
pub use normalize::{normalize, to_record};
pub use reconcile::{ReconcileError, ReconcileReport, Reconciler};
pub use summary::{
    load_window, report_markdown, summarize, AggregatedView, ChartData, ChartSeries, DateWindow,
    MetricTotals, TrendData, UserBreakdown, WindowSelection, DEFAULT_WINDOW_DAYS,
};

pub const CRATE_NAME: &str = "perfdash-sync";

/// Counters describing what one run saw upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncDiagnostics {
    pub pages_fetched: u32,
    pub prospections: usize,
    pub leads: usize,
    pub malformed_records: usize,
    pub unattributed_prospections: usize,
    pub unattributed_leads: usize,
    pub orphaned_leads: usize,
    pub sentinel_rows: usize,
    pub fallback_keyed_users: usize,
    pub key_collisions: usize,
}

impl SyncDiagnostics {
    fn from_run(snapshot: &UpstreamSnapshot, report: &AggregationReport) -> Self {
        Self {
            pages_fetched: snapshot.pages_fetched,
            prospections: report.prospections_seen,
            leads: report.leads_seen,
            malformed_records: snapshot.malformed_records,
            unattributed_prospections: report.unattributed_prospections,
            unattributed_leads: report.unattributed_leads,
            orphaned_leads: report.orphaned_leads,
            sentinel_rows: report.sentinel_rows,
            fallback_keyed_users: report.fallback_keyed_users,
            key_collisions: report.key_collisions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_id: &'static str,
    pub sync_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub users: usize,
    pub records_saved: usize,
    pub diagnostics: SyncDiagnostics,
}

/// A run that completed. Failures are [`SyncError`]s.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced(SyncRunSummary),
    /// Upstream answered but nothing could be attributed to a user.
    NoData(SyncRunSummary),
}

impl SyncOutcome {
    pub fn summary(&self) -> &SyncRunSummary {
        match self {
            Self::Synced(summary) | Self::NoData(summary) => summary,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream rejected the request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },
    #[error("persistence failed after saving {saved} of {submitted} records: {message}")]
    Persistence {
        saved: usize,
        submitted: usize,
        message: String,
    },
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::Persistence { .. } => "persistence_failed",
        }
    }
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Rejected { status, message } => {
                Self::UpstreamRejected { status, message }
            }
            AdapterError::Unavailable(message) => Self::UpstreamUnavailable(message),
            AdapterError::Malformed(message) => {
                Self::UpstreamUnavailable(format!("unreadable response: {message}"))
            }
            AdapterError::Anyhow(err) => Self::UpstreamUnavailable(format!("{err:#}")),
        }
    }
}

impl From<ReconcileError> for SyncError {
    fn from(err: ReconcileError) -> Self {
        Self::Persistence {
            saved: err.saved,
            submitted: err.submitted,
            message: err.source.to_string(),
        }
    }
}

/// Fetch + aggregate without writing anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncPreview {
    pub run_id: Uuid,
    pub source_id: &'static str,
    pub users: Vec<UserAggregate>,
    pub diagnostics: SyncDiagnostics,
}

pub struct SyncPipeline {
    settings: PipelineSettings,
    source: Arc<dyn PageSource>,
    store: Arc<dyn PerformanceStore>,
    aggregator: MetricAggregator,
    overrides: MetricOverrides,
}

impl SyncPipeline {
    pub fn new(
        settings: PipelineSettings,
        source: Arc<dyn PageSource>,
        store: Arc<dyn PerformanceStore>,
    ) -> Self {
        Self {
            settings,
            source,
            store,
            aggregator: MetricAggregator::default(),
            overrides: MetricOverrides::default(),
        }
    }

    /// Overrides applied on every run; per-run overrides take precedence.
    pub fn with_overrides(mut self, overrides: MetricOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn store(&self) -> Arc<dyn PerformanceStore> {
        Arc::clone(&self.store)
    }

    fn effective_overrides(&self, run_overrides: &MetricOverrides) -> MetricOverrides {
        let mut merged = self.overrides.clone();
        merged.merge(run_overrides.clone());
        merged
    }

    async fn collect(
        &self,
        run_id: Uuid,
        run_overrides: &MetricOverrides,
    ) -> Result<(AggregationReport, SyncDiagnostics), SyncError> {
        let ctx = AdapterContext::new(run_id);
        let snapshot = fetch_snapshot(self.source.as_ref(), &ctx, self.settings.pagination).await?;
        let overrides = self.effective_overrides(run_overrides);
        let report = self
            .aggregator
            .aggregate(&snapshot.prospections, &snapshot.leads, &overrides);
        let diagnostics = SyncDiagnostics::from_run(&snapshot, &report);
        Ok((report, diagnostics))
    }

    /// Runs one cycle stamped with today's local date.
    pub async fn run_once(&self, overrides: &MetricOverrides) -> Result<SyncOutcome, SyncError> {
        self.run_once_on(Local::now().date_naive(), overrides).await
    }

    pub async fn run_once_on(
        &self,
        sync_date: NaiveDate,
        overrides: &MetricOverrides,
    ) -> Result<SyncOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sync_run",
            %run_id,
            source_id = self.source.source_id(),
            %sync_date
        );
        self.run_inner(run_id, sync_date, overrides)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        sync_date: NaiveDate,
        overrides: &MetricOverrides,
    ) -> Result<SyncOutcome, SyncError> {
        let started_at = Utc::now();
        let (report, diagnostics) = self.collect(run_id, overrides).await.inspect_err(|err| {
            warn!(error = %err, "sync aborted before persisting; existing rows keep serving reads")
        })?;

        let records = normalize(&report.users, sync_date);
        let mut summary = SyncRunSummary {
            run_id,
            source_id: self.source.source_id(),
            sync_date,
            started_at,
            finished_at: started_at,
            users: records.len(),
            records_saved: 0,
            diagnostics,
        };

        if records.is_empty() {
            summary.finished_at = Utc::now();
            info!(?diagnostics, "no attributable records upstream");
            return Ok(SyncOutcome::NoData(summary));
        }

        let reconciler = Reconciler::new(Arc::clone(&self.store), self.settings.upsert_chunk_size);
        let reconciled = reconciler.reconcile(&records).await?;
        summary.records_saved = reconciled.saved;
        summary.finished_at = Utc::now();
        info!(
            users = summary.users,
            saved = summary.records_saved,
            pages = diagnostics.pages_fetched,
            "sync complete"
        );
        Ok(SyncOutcome::Synced(summary))
    }

    pub async fn preview(&self, overrides: &MetricOverrides) -> Result<SyncPreview, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_preview", %run_id, source_id = self.source.source_id());
        let (report, diagnostics) = self.collect(run_id, overrides).instrument(span).await?;
        Ok(SyncPreview {
            run_id,
            source_id: self.source.source_id(),
            users: report.users,
            diagnostics,
        })
    }

    /// Read-side view over `window`, falling back to the newest rows when it is empty.
    pub async fn view(&self, window: DateWindow) -> Result<AggregatedView> {
        let selection = load_window(self.store.as_ref(), window, self.settings.fallback_limit)
            .await
            .context("loading performance rows")?;
        Ok(summarize(window, &selection))
    }
}

/// Registers the periodic sync job when the scheduler is enabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once(&MetricOverrides::default()).await {
                Ok(outcome) => info!(
                    run_id = %outcome.summary().run_id,
                    saved = outcome.summary().records_saved,
                    "scheduled sync finished"
                ),
                Err(err) => error!(kind = err.kind(), error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub fn gs_engage_source(config: &SyncConfig, upstream: UpstreamConfig) -> Result<GsEngageClient> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    Ok(GsEngageClient::new(http, upstream))
}

/// Pipeline over explicit collaborators, with the configured overrides file applied.
pub async fn pipeline_from_config(
    config: &SyncConfig,
    source: Arc<dyn PageSource>,
    store: Arc<dyn PerformanceStore>,
) -> Result<SyncPipeline> {
    let pipeline = SyncPipeline::new(config.pipeline, source, store);
    match &config.overrides_path {
        Some(path) => {
            let overrides = load_overrides_file(path).await?;
            info!(path = %path.display(), "loaded metric overrides");
            Ok(pipeline.with_overrides(overrides))
        }
        None => Ok(pipeline),
    }
}

pub async fn load_overrides_file(path: &Path) -> Result<MetricOverrides> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
