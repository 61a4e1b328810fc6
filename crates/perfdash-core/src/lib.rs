//! Core domain model for the GS Engage performance dashboard.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "perfdash-core";

/// Stored in `on_time` until the upstream exposes timestamped activities.
pub const ON_TIME_PLACEHOLDER: f64 = 95.0;

/// Rows the upstream (or older report paths) emit as aggregates rather than people.
pub const SENTINEL_ROW_NAMES: &[&str] = &["Average", "Total", "Média Por SDR"];

pub fn is_sentinel_row_name(name: &str) -> bool {
    let name = name.trim();
    SENTINEL_ROW_NAMES
        .iter()
        .any(|sentinel| sentinel.eq_ignore_ascii_case(name))
}

/// Lowercase with whitespace runs collapsed to `_`. Used as a degraded user key.
pub fn normalized_name_key(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

pub fn numeric_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

pub fn count_or_zero(value: f64) -> i64 {
    numeric_or_zero(value).round() as i64
}

/// Reads a JSON number or numeric string; anything else is 0.
pub fn lenient_number(value: &JsonValue) -> f64 {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64().unwrap_or(0.0),
        JsonValue::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    numeric_or_zero(parsed)
}

fn de_lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(lenient_number(&value))
}

fn de_lenient_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, JsonValue>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, lenient_number(&v)))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProspectionStatus {
    Active,
    Finished,
    Closed,
    Won,
    Lost,
    #[serde(untagged)]
    Other(String),
}

impl ProspectionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Self::Active,
            "FINISHED" => Self::Finished,
            "CLOSED" => Self::Closed,
            "WON" => Self::Won,
            "LOST" => Self::Lost,
            other => Self::Other(other.to_string()),
        }
    }

    /// FINISHED, CLOSED and WON end a prospection's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Closed | Self::Won)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Upstream,
    NameFallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserKey {
    pub value: String,
    #[serde(skip)]
    pub fallback: bool,
}

impl UserKey {
    pub fn source(&self) -> KeySource {
        if self.fallback {
            KeySource::NameFallback
        } else {
            KeySource::Upstream
        }
    }
}

/// The sales rep a prospection or lead is assigned to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsibleUser {
    pub id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

impl ResponsibleUser {
    /// "First Last", then email, else empty.
    pub fn display_name(&self) -> String {
        let full = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or_default(),
            self.last_name.as_deref().unwrap_or_default()
        );
        let full = full.trim();
        if !full.is_empty() {
            return full.to_string();
        }
        self.email
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    }

    /// Upstream id when present, otherwise the normalized display name.
    pub fn user_key(&self) -> Option<UserKey> {
        if let Some(id) = self.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return Some(UserKey {
                value: id.to_string(),
                fallback: false,
            });
        }
        let name = self.display_name();
        if name.is_empty() {
            return None;
        }
        Some(UserKey {
            value: normalized_name_key(&name),
            fallback: true,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prospection {
    pub id: Option<String>,
    pub responsible: Option<ResponsibleUser>,
    pub status: ProspectionStatus,
    pub has_meeting: bool,
    pub lost_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Prospection {
    pub fn duration_hours(&self) -> Option<f64> {
        let (start, end) = (self.started_at?, self.ended_at?);
        Some((end - start).num_milliseconds() as f64 / 3_600_000.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Option<String>,
    pub responsible: Option<ResponsibleUser>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeetingOverride {
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub scheduled: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub completed: f64,
}

/// Externally computed per-user metrics that supersede the estimated ones.
///
/// Keys are either upstream user ids or [`normalized_name_key`] values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricOverrides {
    #[serde(deserialize_with = "de_lenient_map")]
    pub calls: BTreeMap<String, f64>,
    pub meetings: BTreeMap<String, MeetingOverride>,
    #[serde(deserialize_with = "de_lenient_map")]
    pub contracts: BTreeMap<String, f64>,
    #[serde(deserialize_with = "de_lenient_map")]
    pub noshow: BTreeMap<String, f64>,
    #[serde(deserialize_with = "de_lenient_map")]
    pub closing: BTreeMap<String, f64>,
    #[serde(deserialize_with = "de_lenient_map")]
    pub lead_time: BTreeMap<String, f64>,
}

impl MetricOverrides {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
            && self.meetings.is_empty()
            && self.contracts.is_empty()
            && self.noshow.is_empty()
            && self.closing.is_empty()
            && self.lead_time.is_empty()
    }

    /// Entries in `other` win over entries already present.
    pub fn merge(&mut self, other: MetricOverrides) {
        self.calls.extend(other.calls);
        self.meetings.extend(other.meetings);
        self.contracts.extend(other.contracts);
        self.noshow.extend(other.noshow);
        self.closing.extend(other.closing);
        self.lead_time.extend(other.lead_time);
    }

    /// First hit across `keys`, in order.
    pub fn lookup<'a, T>(map: &'a BTreeMap<String, T>, keys: &[&str]) -> Option<&'a T> {
        keys.iter().find_map(|key| map.get(*key))
    }
}

/// Totals the CRM reports for a user, kept apart from internally recomputed proxies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportedTotals {
    pub leads_started: f64,
    pub leads_finished: f64,
    pub earnings: f64,
}

/// Per-user metrics derived during one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAggregate {
    pub user_key: String,
    pub key_source: KeySource,
    pub user_name: String,
    pub prospections: i64,
    pub leads: i64,
    pub active_prospections: i64,
    pub finished_prospections: i64,
    pub won_prospections: i64,
    pub lost_prospections: i64,
    pub calls: i64,
    pub meetings_scheduled: i64,
    pub meetings_completed: i64,
    pub contracts: i64,
    pub closing: i64,
    pub noshow: i64,
    pub lead_time_hours: f64,
    pub conversion_rate: f64,
    pub daily_activities: i64,
    pub on_time: f64,
    pub reported: Option<ReportedTotals>,
}

impl UserAggregate {
    pub fn empty(key: &UserKey, user_name: impl Into<String>) -> Self {
        Self {
            user_key: key.value.clone(),
            key_source: key.source(),
            user_name: user_name.into(),
            prospections: 0,
            leads: 0,
            active_prospections: 0,
            finished_prospections: 0,
            won_prospections: 0,
            lost_prospections: 0,
            calls: 0,
            meetings_scheduled: 0,
            meetings_completed: 0,
            contracts: 0,
            closing: 0,
            noshow: 0,
            lead_time_hours: 0.0,
            conversion_rate: 0.0,
            daily_activities: 0,
            on_time: ON_TIME_PLACEHOLDER,
            reported: None,
        }
    }

    pub fn name_key(&self) -> String {
        normalized_name_key(&self.user_name)
    }
}

/// One row of `performance_data`, unique on `(user_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub user_id: String,
    pub user_name: String,
    pub date: NaiveDate,
    pub daily_activities: i64,
    pub on_time: f64,
    pub leads_started: i64,
    pub leads_finished: i64,
    pub conversion_rate: f64,
    pub earnings: f64,
    pub calls: i64,
    pub meetings_scheduled: i64,
    pub meetings_completed: i64,
    pub contracts_generated: i64,
    pub noshow: i64,
    pub closing: i64,
    pub lead_time: f64,
}

impl PerformanceRecord {
    pub fn natural_key(&self) -> (&str, NaiveDate) {
        (self.user_id.as_str(), self.date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_is_case_insensitive_and_keeps_unknowns() {
        assert_eq!(ProspectionStatus::parse("won"), ProspectionStatus::Won);
        assert_eq!(ProspectionStatus::parse(" Closed "), ProspectionStatus::Closed);
        assert_eq!(
            ProspectionStatus::parse("paused"),
            ProspectionStatus::Other("PAUSED".into())
        );
        assert!(!ProspectionStatus::parse("LOST").is_terminal());
    }

    #[test]
    fn user_key_prefers_upstream_id() {
        let user = ResponsibleUser {
            id: Some("u-1".into()),
            first_name: Some("João".into()),
            last_name: Some("Silva".into()),
            email: None,
        };
        let key = user.user_key().expect("key");
        assert_eq!(key.value, "u-1");
        assert_eq!(key.source(), KeySource::Upstream);
    }

    #[test]
    fn user_key_falls_back_to_normalized_name_then_email() {
        let named = ResponsibleUser {
            id: Some("  ".into()),
            first_name: Some("João".into()),
            last_name: Some("Silva".into()),
            email: None,
        };
        let key = named.user_key().expect("key");
        assert_eq!(key.value, "joão_silva");
        assert!(key.fallback);

        let email_only = ResponsibleUser {
            email: Some("ana@example.com".into()),
            ..Default::default()
        };
        assert_eq!(email_only.display_name(), "ana@example.com");
        assert!(ResponsibleUser::default().user_key().is_none());
    }

    #[test]
    fn sentinel_rows_are_detected() {
        assert!(is_sentinel_row_name("Total"));
        assert!(is_sentinel_row_name(" average "));
        assert!(is_sentinel_row_name("Média Por SDR"));
        assert!(!is_sentinel_row_name("Totalina Souza"));
    }

    #[test]
    fn overrides_parse_leniently() {
        let overrides: MetricOverrides = serde_json::from_value(serde_json::json!({
            "calls": {"joao_silva": 50, "ana": "12", "bad": "n/a"},
            "meetings": {"joao_silva": {"scheduled": "4"}},
            "leadTime": {"joao_silva": 6.5}
        }))
        .expect("overrides");
        assert_eq!(overrides.calls["joao_silva"], 50.0);
        assert_eq!(overrides.calls["ana"], 12.0);
        assert_eq!(overrides.calls["bad"], 0.0);
        assert_eq!(overrides.meetings["joao_silva"].scheduled, 4.0);
        assert_eq!(overrides.meetings["joao_silva"].completed, 0.0);
        assert_eq!(overrides.lead_time["joao_silva"], 6.5);
        assert!(overrides.contracts.is_empty());
    }

    #[test]
    fn merge_prefers_later_overrides() {
        let mut base = MetricOverrides::default();
        base.calls.insert("a".into(), 1.0);
        base.calls.insert("b".into(), 2.0);
        let mut later = MetricOverrides::default();
        later.calls.insert("a".into(), 10.0);
        base.merge(later);
        assert_eq!(base.calls["a"], 10.0);
        assert_eq!(base.calls["b"], 2.0);
        assert_eq!(
            MetricOverrides::lookup(&base.calls, &["missing", "b"]),
            Some(&2.0)
        );
    }

    #[test]
    fn non_finite_numbers_become_zero() {
        assert_eq!(numeric_or_zero(f64::NAN), 0.0);
        assert_eq!(count_or_zero(f64::INFINITY), 0);
        assert_eq!(count_or_zero(2.6), 3);
    }
}
