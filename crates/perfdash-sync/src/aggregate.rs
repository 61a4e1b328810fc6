//! Per-user metric derivation from one prospection/lead snapshot.

use std::collections::BTreeMap;

use perfdash_core::{
    count_or_zero, is_sentinel_row_name, numeric_or_zero, Lead, MetricOverrides, Prospection,
    ProspectionStatus, ReportedTotals, ResponsibleUser, UserAggregate, UserKey,
};
use serde::Serialize;
use tracing::{debug, warn};

/// Lost reasons containing any of these (case-insensitive) count as a no-show.
pub const NO_SHOW_MARKERS: &[&str] = &["no-show", "no show", "ausente"];

/// Durations above one year are treated as data errors.
pub const MAX_LEAD_TIME_HOURS: f64 = 8760.0;

/// Estimated calls per prospection until the upstream exposes call logs.
pub const CALLS_PER_PROSPECTION: i64 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationReport {
    pub users: Vec<UserAggregate>,
    pub prospections_seen: usize,
    pub leads_seen: usize,
    pub unattributed_prospections: usize,
    pub unattributed_leads: usize,
    pub orphaned_leads: usize,
    pub sentinel_rows: usize,
    pub fallback_keyed_users: usize,
    /// Users reached through both an upstream id and a name fallback that produced the same key.
    pub key_collisions: usize,
}

#[derive(Debug, Clone)]
pub struct MetricAggregator {
    no_show_markers: Vec<String>,
    max_lead_time_hours: f64,
}

impl Default for MetricAggregator {
    fn default() -> Self {
        Self {
            no_show_markers: NO_SHOW_MARKERS.iter().map(|m| m.to_string()).collect(),
            max_lead_time_hours: MAX_LEAD_TIME_HOURS,
        }
    }
}

struct Bucket {
    aggregate: UserAggregate,
    lead_times: Vec<f64>,
    id_keyed: bool,
    name_keyed: bool,
}

impl Bucket {
    fn new(key: &UserKey, name: String) -> Self {
        Self {
            aggregate: UserAggregate::empty(key, name),
            lead_times: Vec::new(),
            id_keyed: false,
            name_keyed: false,
        }
    }

    fn note_key(&mut self, key: &UserKey) {
        if key.fallback {
            self.name_keyed = true;
        } else {
            self.id_keyed = true;
        }
    }
}

fn attribution(responsible: Option<&ResponsibleUser>) -> Option<(UserKey, String)> {
    let responsible = responsible?;
    let key = responsible.user_key()?;
    let name = responsible.display_name();
    let name = if name.is_empty() { key.value.clone() } else { name };
    Some((key, name))
}

impl MetricAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_no_show(&self, lost_reason: Option<&str>) -> bool {
        let Some(reason) = lost_reason else {
            return false;
        };
        let reason = reason.to_lowercase();
        self.no_show_markers
            .iter()
            .any(|marker| reason.contains(marker.as_str()))
    }

    pub fn aggregate(
        &self,
        prospections: &[Prospection],
        leads: &[Lead],
        overrides: &MetricOverrides,
    ) -> AggregationReport {
        let mut report = AggregationReport {
            prospections_seen: prospections.len(),
            leads_seen: leads.len(),
            ..Default::default()
        };
        let mut buckets: BTreeMap<String, Bucket> = BTreeMap::new();

        for prospection in prospections {
            let Some((key, name)) = attribution(prospection.responsible.as_ref()) else {
                report.unattributed_prospections += 1;
                continue;
            };
            if is_sentinel_row_name(&name) {
                report.sentinel_rows += 1;
                continue;
            }
            let bucket = buckets
                .entry(key.value.clone())
                .or_insert_with(|| Bucket::new(&key, name));
            bucket.note_key(&key);
            self.tally(bucket, prospection);
        }

        for lead in leads {
            let Some((key, _)) = attribution(lead.responsible.as_ref()) else {
                report.unattributed_leads += 1;
                continue;
            };
            match buckets.get_mut(&key.value) {
                Some(bucket) => {
                    bucket.note_key(&key);
                    bucket.aggregate.leads += 1;
                }
                None => {
                    debug!(
                        user_key = %key.value,
                        lead_id = ?lead.id,
                        "lead has no prospection bucket"
                    );
                    report.orphaned_leads += 1;
                }
            }
        }

        if report.unattributed_prospections > 0 || report.unattributed_leads > 0 {
            warn!(
                prospections = report.unattributed_prospections,
                leads = report.unattributed_leads,
                "skipped records without a responsible user"
            );
        }

        for bucket in buckets.values().filter(|b| b.name_keyed) {
            let user = &bucket.aggregate;
            report.fallback_keyed_users += 1;
            if bucket.id_keyed {
                report.key_collisions += 1;
                warn!(
                    user_key = %user.user_key,
                    user_name = %user.user_name,
                    "name fallback key equals an upstream id; records were merged into one user"
                );
            } else {
                warn!(
                    user_key = %user.user_key,
                    user_name = %user.user_name,
                    "no upstream id; keyed by normalized name, users sharing this name will merge"
                );
            }
        }

        report.users = buckets
            .into_values()
            .map(|bucket| self.finish(bucket, overrides))
            .collect();
        report
    }

    fn tally(&self, bucket: &mut Bucket, prospection: &Prospection) {
        let agg = &mut bucket.aggregate;
        agg.prospections += 1;

        match &prospection.status {
            ProspectionStatus::Active => agg.active_prospections += 1,
            ProspectionStatus::Finished | ProspectionStatus::Closed => {
                agg.finished_prospections += 1
            }
            ProspectionStatus::Won => {
                agg.won_prospections += 1;
                agg.contracts += 1;
                agg.closing += 1;
            }
            ProspectionStatus::Lost => {
                agg.lost_prospections += 1;
                if self.is_no_show(prospection.lost_reason.as_deref()) {
                    agg.noshow += 1;
                }
            }
            ProspectionStatus::Other(status) => {
                debug!(%status, prospection_id = ?prospection.id, "unclassified status");
            }
        }

        if prospection.has_meeting {
            agg.meetings_scheduled += 1;
            if prospection.status.is_terminal() {
                agg.meetings_completed += 1;
            }
        }

        if prospection.status.is_terminal() {
            if let Some(hours) = prospection
                .duration_hours()
                .filter(|h| *h > 0.0 && *h <= self.max_lead_time_hours)
            {
                bucket.lead_times.push(hours);
            }
        }
    }

    fn finish(&self, bucket: Bucket, overrides: &MetricOverrides) -> UserAggregate {
        let Bucket {
            mut aggregate,
            lead_times,
            ..
        } = bucket;

        aggregate.calls = aggregate.prospections * CALLS_PER_PROSPECTION;
        aggregate.lead_time_hours = if lead_times.is_empty() {
            0.0
        } else {
            lead_times.iter().sum::<f64>() / lead_times.len() as f64
        };
        let converted = aggregate.finished_prospections + aggregate.won_prospections;
        aggregate.conversion_rate = if aggregate.leads > 0 {
            converted as f64 / aggregate.leads as f64 * 100.0
        } else {
            0.0
        };
        aggregate.daily_activities =
            aggregate.active_prospections + aggregate.calls + aggregate.meetings_scheduled;
        aggregate.reported = Some(ReportedTotals {
            leads_started: aggregate.leads as f64,
            leads_finished: converted as f64,
            earnings: aggregate.contracts as f64,
        });

        apply_overrides(&mut aggregate, overrides);
        aggregate
    }
}

/// Replaces each overridden metric; the upstream id is tried before the name key.
pub fn apply_overrides(aggregate: &mut UserAggregate, overrides: &MetricOverrides) {
    if overrides.is_empty() {
        return;
    }
    let name_key = aggregate.name_key();
    let keys = [aggregate.user_key.as_str(), name_key.as_str()];

    let calls = MetricOverrides::lookup(&overrides.calls, &keys).copied();
    let meetings = MetricOverrides::lookup(&overrides.meetings, &keys).copied();
    let contracts = MetricOverrides::lookup(&overrides.contracts, &keys).copied();
    let noshow = MetricOverrides::lookup(&overrides.noshow, &keys).copied();
    let closing = MetricOverrides::lookup(&overrides.closing, &keys).copied();
    let lead_time = MetricOverrides::lookup(&overrides.lead_time, &keys).copied();

    if let Some(calls) = calls {
        aggregate.calls = count_or_zero(calls);
    }
    if let Some(meetings) = meetings {
        aggregate.meetings_scheduled = count_or_zero(meetings.scheduled);
        aggregate.meetings_completed = count_or_zero(meetings.completed);
    }
    if let Some(contracts) = contracts {
        aggregate.contracts = count_or_zero(contracts);
    }
    if let Some(noshow) = noshow {
        aggregate.noshow = count_or_zero(noshow);
    }
    if let Some(closing) = closing {
        aggregate.closing = count_or_zero(closing);
    }
    if let Some(lead_time) = lead_time {
        aggregate.lead_time_hours = numeric_or_zero(lead_time);
    }
}
