//! Axum + Askama dashboard and JSON API for the performance dashboard.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Local, NaiveDate};
use perfdash_core::MetricOverrides;
use perfdash_storage::{PerformanceStore, PgPerformanceStore};
use perfdash_sync::{
    gs_engage_source, maybe_build_scheduler, pipeline_from_config, upstream_config_from_env,
    ChartData, DateWindow, MetricTotals, SyncConfig, SyncError, SyncOutcome, SyncPipeline,
    UserBreakdown,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "perfdash-web";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match std::env::var("PERFDASH_WEB_PORT") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid PERFDASH_WEB_PORT {raw:?}"))?,
            _ => 8000,
        };
        Ok(Self { port })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }

    fn store(&self) -> Arc<dyn PerformanceStore> {
        self.pipeline.store()
    }
}

#[derive(Debug, Default, Deserialize)]
struct WindowQuery {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

impl WindowQuery {
    fn window(&self) -> DateWindow {
        DateWindow::resolve(self.start, self.end, Local::now().date_naive())
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncRequest {
    #[serde(default)]
    overrides: MetricOverrides,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    window_start: String,
    window_end: String,
    fell_back: bool,
    record_count: usize,
    last_sync: String,
    totals: MetricTotals,
    users: Vec<UserBreakdown>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route(
            "/api/sync",
            get(sync_preview_handler)
                .post(sync_handler)
                .options(preflight_handler),
        )
        .route("/api/sync/status", get(sync_status_handler))
        .route("/api/performance", get(performance_handler))
        .route("/api/performance/chart", get(performance_chart_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Postgres-backed server with the optional background sync job.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let web = WebConfig::from_env()?;
    let config = SyncConfig::from_env()?;
    let upstream = upstream_config_from_env()?;

    let store = PgPerformanceStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    store.migrate().await.context("running migrations")?;

    let source = gs_engage_source(&config, upstream)?;
    let pipeline =
        Arc::new(pipeline_from_config(&config, Arc::new(source), Arc::new(store)).await?);

    let scheduler = maybe_build_scheduler(Arc::clone(&pipeline), &config).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "background sync scheduled");
    }

    let listener = TcpListener::bind(("0.0.0.0", web.port)).await?;
    info!(port = web.port, "dashboard listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let window = query.window();
    let view = match state.pipeline.view(window).await {
        Ok(view) => view,
        Err(err) => return server_error(err),
    };
    let last_sync = match state.store().last_updated_at().await {
        Ok(Some(ts)) => ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
        Ok(None) => "never".to_string(),
        Err(err) => return server_error(err.into()),
    };
    render_html(IndexTemplate {
        window_start: window.start.to_string(),
        window_end: window.end.to_string(),
        fell_back: view.fell_back,
        record_count: view.record_count,
        last_sync,
        totals: view.totals,
        users: view.per_user.into_values().collect(),
    })
}

async fn sync_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        match serde_json::from_slice::<SyncRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "success": false,
                        "status": "invalid_request",
                        "error": format!("invalid request body: {err}"),
                    })),
                )
                    .into_response()
            }
        }
    };

    match state.pipeline.run_once(&request.overrides).await {
        Ok(outcome) => sync_outcome_response(&outcome),
        Err(err) => sync_error_response(err),
    }
}

async fn sync_preview_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.preview(&MetricOverrides::default()).await {
        Ok(preview) => Json(json!({
            "success": true,
            "status": "preview",
            "data": preview.users,
            "diagnostics": preview.diagnostics,
        }))
        .into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store().last_updated_at().await {
        Ok(last_sync) => Json(json!({ "success": true, "last_sync": last_sync })).into_response(),
        Err(err) => api_error(err.into()),
    }
}

async fn performance_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    match state.pipeline.view(query.window()).await {
        Ok(view) => Json(json!({ "success": true, "data": view })).into_response(),
        Err(err) => api_error(err),
    }
}

async fn performance_chart_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    match state.pipeline.view(query.window()).await {
        Ok(view) => {
            let chart = ChartData::from_view(&view);
            let traces = chart
                .series
                .iter()
                .map(|series| {
                    json!({
                        "type": "bar",
                        "name": series.label,
                        "x": chart.labels,
                        "y": series.values,
                    })
                })
                .collect::<Vec<_>>();
            let trend = &chart.trend;
            let mut trend_traces = [
                ("calls", &trend.calls),
                ("meetings_completed", &trend.meetings_completed),
                ("contracts_generated", &trend.contracts_generated),
            ]
            .into_iter()
            .map(|(name, values)| {
                json!({
                    "type": "scatter",
                    "mode": "lines+markers",
                    "name": name,
                    "x": trend.dates,
                    "y": values,
                })
            })
            .collect::<Vec<_>>();
            trend_traces.push(json!({
                "type": "scatter",
                "mode": "lines",
                "name": "conversion_rate",
                "x": trend.dates,
                "y": trend.conversion_rate,
                "yaxis": "y2",
            }));
            Json(json!({
                "data": traces,
                "layout": {
                    "title": "Activity per user",
                    "barmode": "group",
                    "paper_bgcolor": "#ffffff",
                    "plot_bgcolor": "#f8fafc"
                },
                "trend": {
                    "data": trend_traces,
                    "layout": {
                        "title": "Daily trend",
                        "yaxis2": { "title": "conversion %", "overlaying": "y", "side": "right" },
                        "paper_bgcolor": "#ffffff",
                        "plot_bgcolor": "#f8fafc"
                    }
                }
            }))
            .into_response()
        }
        Err(err) => api_error(err),
    }
}

fn sync_outcome_response(outcome: &SyncOutcome) -> Response {
    let summary = outcome.summary();
    let (status, message) = match outcome {
        SyncOutcome::Synced(_) => ("synced", format!("synced {} records", summary.records_saved)),
        SyncOutcome::NoData(_) => ("no_data", "no data to sync".to_string()),
    };
    Json(json!({
        "success": true,
        "status": status,
        "message": message,
        "summary": summary,
    }))
    .into_response()
}

fn sync_error_response(err: SyncError) -> Response {
    let status = match &err {
        SyncError::UpstreamUnavailable(_) | SyncError::UpstreamRejected { .. } => {
            warn!(kind = err.kind(), error = %err, "sync request failed upstream");
            StatusCode::BAD_GATEWAY
        }
        SyncError::Persistence { .. } => {
            error!(kind = err.kind(), error = %err, "sync request failed to persist");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let mut body = json!({
        "success": false,
        "status": err.kind(),
        "error": err.to_string(),
    });
    if let SyncError::Persistence { saved, submitted, .. } = &err {
        body["saved"] = json!(saved);
        body["submitted"] = json!(submitted);
    }
    (status, Json(body)).into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn api_error(err: anyhow::Error) -> Response {
    let message = format!("{err:#}");
    error!(error = %message, "api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err}")),
    )
        .into_response()
}
