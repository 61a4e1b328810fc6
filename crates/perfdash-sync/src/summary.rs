//! Read-side rollups over persisted performance rows.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use perfdash_core::PerformanceRecord;
use perfdash_storage::{PerformanceStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_WINDOW_DAYS: u64 = 30;

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn last_days(today: NaiveDate, days: u64) -> Self {
        let start = today.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN);
        Self::new(start, today)
    }

    /// Missing `end` means today; missing `start` means the default span before `end`.
    pub fn resolve(start: Option<NaiveDate>, end: Option<NaiveDate>, today: NaiveDate) -> Self {
        let end = end.unwrap_or(today);
        match start {
            Some(start) => Self::new(start, end),
            None => Self::last_days(end, DEFAULT_WINDOW_DAYS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSelection {
    pub records: Vec<PerformanceRecord>,
    pub fell_back: bool,
}

/// Rows inside `window`, or the `fallback_limit` newest rows when the window is empty.
pub async fn load_window(
    store: &dyn PerformanceStore,
    window: DateWindow,
    fallback_limit: usize,
) -> Result<WindowSelection, StoreError> {
    let records = store.records_between(window.start, window.end).await?;
    if !records.is_empty() || fallback_limit == 0 {
        return Ok(WindowSelection {
            records,
            fell_back: false,
        });
    }
    let records = store.most_recent(fallback_limit).await?;
    info!(
        start = %window.start,
        end = %window.end,
        returned = records.len(),
        "window empty; serving most recent rows"
    );
    Ok(WindowSelection {
        fell_back: !records.is_empty(),
        records,
    })
}

/// Sums for counts; means for the rate-like columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricTotals {
    pub records: usize,
    pub daily_activities: i64,
    pub leads_started: i64,
    pub leads_finished: i64,
    pub calls: i64,
    pub meetings_scheduled: i64,
    pub meetings_completed: i64,
    pub contracts_generated: i64,
    pub noshow: i64,
    pub closing: i64,
    pub earnings: f64,
    pub conversion_rate: f64,
    pub lead_time: f64,
    pub on_time: f64,
}

impl MetricTotals {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a PerformanceRecord>) -> Self {
        let mut totals = Self::default();
        for record in records {
            totals.records += 1;
            totals.daily_activities += record.daily_activities;
            totals.leads_started += record.leads_started;
            totals.leads_finished += record.leads_finished;
            totals.calls += record.calls;
            totals.meetings_scheduled += record.meetings_scheduled;
            totals.meetings_completed += record.meetings_completed;
            totals.contracts_generated += record.contracts_generated;
            totals.noshow += record.noshow;
            totals.closing += record.closing;
            totals.earnings += record.earnings;
            totals.conversion_rate += record.conversion_rate;
            totals.lead_time += record.lead_time;
            totals.on_time += record.on_time;
        }
        if totals.records > 0 {
            let n = totals.records as f64;
            totals.conversion_rate /= n;
            totals.lead_time /= n;
            totals.on_time /= n;
        }
        totals
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserBreakdown {
    pub user_name: String,
    #[serde(flatten)]
    pub totals: MetricTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedView {
    pub window: DateWindow,
    pub fell_back: bool,
    pub record_count: usize,
    pub totals: MetricTotals,
    pub per_user: BTreeMap<String, UserBreakdown>,
    /// One point per sync date in the selection, oldest first.
    pub by_date: BTreeMap<NaiveDate, MetricTotals>,
}

pub fn summarize(window: DateWindow, selection: &WindowSelection) -> AggregatedView {
    let mut grouped: BTreeMap<&str, Vec<&PerformanceRecord>> = BTreeMap::new();
    let mut dated: BTreeMap<NaiveDate, Vec<&PerformanceRecord>> = BTreeMap::new();
    for record in &selection.records {
        grouped.entry(record.user_id.as_str()).or_default().push(record);
        dated.entry(record.date).or_default().push(record);
    }

    let per_user = grouped
        .into_iter()
        .map(|(user_id, rows)| {
            // Rows arrive newest first, so the first name is the current one.
            let user_name = rows
                .first()
                .map(|r| r.user_name.clone())
                .unwrap_or_default();
            (
                user_id.to_string(),
                UserBreakdown {
                    user_name,
                    totals: MetricTotals::from_records(rows),
                },
            )
        })
        .collect();

    AggregatedView {
        window,
        fell_back: selection.fell_back,
        record_count: selection.records.len(),
        totals: MetricTotals::from_records(&selection.records),
        per_user,
        by_date: dated
            .into_iter()
            .map(|(date, rows)| (date, MetricTotals::from_records(rows)))
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSeries {
    pub label: &'static str,
    pub values: Vec<i64>,
}

/// Daily sums of the headline counts plus the mean conversion rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendData {
    pub dates: Vec<NaiveDate>,
    pub calls: Vec<i64>,
    pub meetings_completed: Vec<i64>,
    pub contracts_generated: Vec<i64>,
    pub conversion_rate: Vec<f64>,
}

impl TrendData {
    pub fn from_view(view: &AggregatedView) -> Self {
        let points = view.by_date.values();
        Self {
            dates: view.by_date.keys().copied().collect(),
            calls: points.clone().map(|t| t.calls).collect(),
            meetings_completed: points.clone().map(|t| t.meetings_completed).collect(),
            contracts_generated: points.clone().map(|t| t.contracts_generated).collect(),
            conversion_rate: points.map(|t| t.conversion_rate).collect(),
        }
    }
}

/// Per-user bars and the per-date trend for the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub series: Vec<ChartSeries>,
    pub trend: TrendData,
}

impl ChartData {
    pub fn from_view(view: &AggregatedView) -> Self {
        let users = view.per_user.values().collect::<Vec<_>>();
        let series = |label: &'static str, pick: fn(&MetricTotals) -> i64| ChartSeries {
            label,
            values: users.iter().map(|u| pick(&u.totals)).collect(),
        };
        Self {
            labels: users.iter().map(|u| u.user_name.clone()).collect(),
            series: vec![
                series("calls", |t| t.calls),
                series("meetings_scheduled", |t| t.meetings_scheduled),
                series("meetings_completed", |t| t.meetings_completed),
                series("contracts_generated", |t| t.contracts_generated),
            ],
            trend: TrendData::from_view(view),
        }
    }
}

pub fn report_markdown(view: &AggregatedView) -> String {
    let mut lines = vec![
        "# Performance report".to_string(),
        String::new(),
        format!("- window: {} to {}", view.window.start, view.window.end),
        format!("- records: {}", view.record_count),
    ];
    if view.fell_back {
        lines.push("- note: no rows inside the window; showing the most recent rows".to_string());
    }
    let t = &view.totals;
    lines.extend([
        String::new(),
        "## Totals".to_string(),
        format!("- daily activities: {}", t.daily_activities),
        format!("- calls: {}", t.calls),
        format!(
            "- meetings: {} scheduled, {} completed",
            t.meetings_scheduled, t.meetings_completed
        ),
        format!("- contracts: {} (closing {})", t.contracts_generated, t.closing),
        format!("- no-shows: {}", t.noshow),
        format!("- leads: {} started, {} finished", t.leads_started, t.leads_finished),
        format!("- conversion rate (mean): {:.1}%", t.conversion_rate),
        format!("- lead time (mean): {:.1}h", t.lead_time),
        String::new(),
        "## Per user".to_string(),
        String::new(),
        "| user | calls | meetings | contracts | no-shows | conversion | lead time |".to_string(),
        "|---|---:|---:|---:|---:|---:|---:|".to_string(),
    ]);
    for user in view.per_user.values() {
        let u = &user.totals;
        lines.push(format!(
            "| {} | {} | {}/{} | {} | {} | {:.1}% | {:.1}h |",
            user.user_name,
            u.calls,
            u.meetings_completed,
            u.meetings_scheduled,
            u.contracts_generated,
            u.noshow,
            u.conversion_rate,
            u.lead_time
        ));
    }
    if !view.by_date.is_empty() {
        lines.extend([
            String::new(),
            "## Per day".to_string(),
            String::new(),
            "| date | calls | meetings completed | contracts | conversion |".to_string(),
            "|---|---:|---:|---:|---:|".to_string(),
        ]);
        for (date, t) in &view.by_date {
            lines.push(format!(
                "| {} | {} | {} | {} | {:.1}% |",
                date, t.calls, t.meetings_completed, t.contracts_generated, t.conversion_rate
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}
