//! Aggregates to storable rows.

use std::collections::HashMap;

use chrono::NaiveDate;
use perfdash_core::{count_or_zero, numeric_or_zero, PerformanceRecord, UserAggregate};
use tracing::warn;

pub fn to_record(aggregate: &UserAggregate, date: NaiveDate) -> PerformanceRecord {
    let reported = aggregate.reported.unwrap_or_default();
    PerformanceRecord {
        user_id: aggregate.user_key.clone(),
        user_name: aggregate.user_name.clone(),
        date,
        daily_activities: aggregate.daily_activities,
        on_time: numeric_or_zero(aggregate.on_time),
        leads_started: count_or_zero(reported.leads_started),
        leads_finished: count_or_zero(reported.leads_finished),
        conversion_rate: numeric_or_zero(aggregate.conversion_rate),
        earnings: numeric_or_zero(reported.earnings),
        calls: aggregate.calls,
        meetings_scheduled: aggregate.meetings_scheduled,
        meetings_completed: aggregate.meetings_completed,
        contracts_generated: aggregate.contracts,
        noshow: aggregate.noshow,
        closing: aggregate.closing,
        lead_time: numeric_or_zero(aggregate.lead_time_hours),
    }
}

/// One record per aggregate stamped with `date`. Later duplicates of a `(user_id, date)` pair
/// replace earlier ones in place.
pub fn normalize(aggregates: &[UserAggregate], date: NaiveDate) -> Vec<PerformanceRecord> {
    let mut records: Vec<PerformanceRecord> = Vec::with_capacity(aggregates.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for aggregate in aggregates {
        let record = to_record(aggregate, date);
        match positions.get(&record.user_id) {
            Some(&index) => {
                warn!(
                    user_id = %record.user_id,
                    %date,
                    "duplicate user in batch; keeping the later aggregate"
                );
                records[index] = record;
            }
            None => {
                positions.insert(record.user_id.clone(), records.len());
                records.push(record);
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfdash_core::{ReportedTotals, UserKey, ON_TIME_PLACEHOLDER};

    fn aggregate(key: &str, calls: i64) -> UserAggregate {
        let mut agg = UserAggregate::empty(
            &UserKey {
                value: key.to_string(),
                fallback: false,
            },
            format!("User {key}"),
        );
        agg.calls = calls;
        agg
    }

    #[test]
    fn missing_reported_totals_and_non_finite_values_become_zero() {
        let mut agg = aggregate("u1", 4);
        agg.conversion_rate = f64::NAN;
        agg.lead_time_hours = f64::INFINITY;

        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let records = normalize(&[agg], date);
        let record = &records[0];
        assert_eq!(record.natural_key(), ("u1", date));
        assert_eq!(record.calls, 4);
        assert_eq!(record.on_time, ON_TIME_PLACEHOLDER);
        assert_eq!(record.conversion_rate, 0.0);
        assert_eq!(record.lead_time, 0.0);
        assert_eq!((record.leads_started, record.leads_finished), (0, 0));
        assert_eq!(record.earnings, 0.0);
    }

    #[test]
    fn reported_totals_fill_lead_and_earning_columns() {
        let mut agg = aggregate("u1", 0);
        agg.contracts = 2;
        agg.reported = Some(ReportedTotals {
            leads_started: 7.0,
            leads_finished: 3.0,
            earnings: 2.0,
        });
        let record = to_record(&agg, NaiveDate::from_ymd_opt(2026, 3, 10).unwrap());
        assert_eq!(record.leads_started, 7);
        assert_eq!(record.leads_finished, 3);
        assert_eq!(record.earnings, 2.0);
        assert_eq!(record.contracts_generated, 2);
    }

    #[test]
    fn duplicate_users_collapse_to_the_last_aggregate() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let records = normalize(
            &[aggregate("u1", 2), aggregate("u2", 4), aggregate("u1", 8)],
            date,
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user_id, "u1");
        assert_eq!(records[0].calls, 8);
        assert_eq!(records[1].user_id, "u2");
    }
}
