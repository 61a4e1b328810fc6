use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use perfdash_core::PerformanceRecord;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Unavailable(String),
}

/// Persistence for `performance_data` rows keyed on `(user_id, date)`.
#[async_trait]
pub trait PerformanceStore: Send + Sync {
    /// Insert new keys and overwrite every field of existing ones. Returns rows written.
    async fn upsert(&self, records: &[PerformanceRecord]) -> Result<usize, StoreError>;

    /// Rows with `start <= date <= end`, newest date first.
    async fn records_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PerformanceRecord>, StoreError>;

    /// The `limit` newest rows regardless of date.
    async fn most_recent(&self, limit: usize) -> Result<Vec<PerformanceRecord>, StoreError>;

    async fn last_updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

const RECORD_COLUMNS: &str = "user_id, user_name, date, daily_activities, on_time, leads_started, \
     leads_finished, conversion_rate, earnings, calls, meetings_scheduled, meetings_completed, \
     contracts_generated, noshow, closing, lead_time";

#[derive(Debug, Clone)]
pub struct PgPerformanceStore {
    pool: PgPool,
}

impl PgPerformanceStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn row_to_record(row: &PgRow) -> Result<PerformanceRecord, sqlx::Error> {
    Ok(PerformanceRecord {
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        date: row.try_get("date")?,
        daily_activities: row.try_get("daily_activities")?,
        on_time: row.try_get("on_time")?,
        leads_started: row.try_get("leads_started")?,
        leads_finished: row.try_get("leads_finished")?,
        conversion_rate: row.try_get("conversion_rate")?,
        earnings: row.try_get("earnings")?,
        calls: row.try_get("calls")?,
        meetings_scheduled: row.try_get("meetings_scheduled")?,
        meetings_completed: row.try_get("meetings_completed")?,
        contracts_generated: row.try_get("contracts_generated")?,
        noshow: row.try_get("noshow")?,
        closing: row.try_get("closing")?,
        lead_time: row.try_get("lead_time")?,
    })
}

#[async_trait]
impl PerformanceStore for PgPerformanceStore {
    async fn upsert(&self, records: &[PerformanceRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO performance_data ({RECORD_COLUMNS}) "));
        qb.push_values(records.iter(), |mut b, r| {
            b.push_bind(r.user_id.clone())
                .push_bind(r.user_name.clone())
                .push_bind(r.date)
                .push_bind(r.daily_activities)
                .push_bind(r.on_time)
                .push_bind(r.leads_started)
                .push_bind(r.leads_finished)
                .push_bind(r.conversion_rate)
                .push_bind(r.earnings)
                .push_bind(r.calls)
                .push_bind(r.meetings_scheduled)
                .push_bind(r.meetings_completed)
                .push_bind(r.contracts_generated)
                .push_bind(r.noshow)
                .push_bind(r.closing)
                .push_bind(r.lead_time);
        });
        qb.push(
            r#"
            ON CONFLICT (user_id, date) DO UPDATE SET
                user_name = EXCLUDED.user_name,
                daily_activities = EXCLUDED.daily_activities,
                on_time = EXCLUDED.on_time,
                leads_started = EXCLUDED.leads_started,
                leads_finished = EXCLUDED.leads_finished,
                conversion_rate = EXCLUDED.conversion_rate,
                earnings = EXCLUDED.earnings,
                calls = EXCLUDED.calls,
                meetings_scheduled = EXCLUDED.meetings_scheduled,
                meetings_completed = EXCLUDED.meetings_completed,
                contracts_generated = EXCLUDED.contracts_generated,
                noshow = EXCLUDED.noshow,
                closing = EXCLUDED.closing,
                lead_time = EXCLUDED.lead_time,
                updated_at = NOW()
            "#,
        );

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn records_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PerformanceRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
              FROM performance_data
             WHERE date >= $1
               AND date <= $2
             ORDER BY date DESC, user_id
            "#
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn most_recent(&self, limit: usize) -> Result<Vec<PerformanceRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
              FROM performance_data
             ORDER BY date DESC, updated_at DESC
             LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn last_updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT MAX(updated_at) AS last_updated_at FROM performance_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("last_updated_at")?)
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    record: PerformanceRecord,
    updated_at: DateTime<Utc>,
}

/// Process-local store with the same upsert semantics as the Postgres table.
#[derive(Debug, Default)]
pub struct InMemoryPerformanceStore {
    rows: Mutex<BTreeMap<(String, NaiveDate), StoredRow>>,
}

impl InMemoryPerformanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seeded(records: Vec<PerformanceRecord>) -> Self {
        let store = Self::new();
        {
            let mut rows = store.rows.lock().await;
            let now = Utc::now();
            for record in records {
                rows.insert(
                    (record.user_id.clone(), record.date),
                    StoredRow {
                        record,
                        updated_at: now,
                    },
                );
            }
        }
        store
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    pub async fn get(&self, user_id: &str, date: NaiveDate) -> Option<PerformanceRecord> {
        self.rows
            .lock()
            .await
            .get(&(user_id.to_string(), date))
            .map(|row| row.record.clone())
    }
}

fn newest_first(rows: &mut [StoredRow]) {
    rows.sort_by(|a, b| {
        b.record
            .date
            .cmp(&a.record.date)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.record.user_id.cmp(&b.record.user_id))
    });
}

#[async_trait]
impl PerformanceStore for InMemoryPerformanceStore {
    async fn upsert(&self, records: &[PerformanceRecord]) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().await;
        let now = Utc::now();
        for record in records {
            rows.insert(
                (record.user_id.clone(), record.date),
                StoredRow {
                    record: record.clone(),
                    updated_at: now,
                },
            );
        }
        Ok(records.len())
    }

    async fn records_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PerformanceRecord>, StoreError> {
        let rows = self.rows.lock().await;
        let mut selected = rows
            .values()
            .filter(|row| row.record.date >= start && row.record.date <= end)
            .cloned()
            .collect::<Vec<_>>();
        newest_first(&mut selected);
        Ok(selected.into_iter().map(|row| row.record).collect())
    }

    async fn most_recent(&self, limit: usize) -> Result<Vec<PerformanceRecord>, StoreError> {
        let rows = self.rows.lock().await;
        let mut selected = rows.values().cloned().collect::<Vec<_>>();
        newest_first(&mut selected);
        Ok(selected
            .into_iter()
            .take(limit)
            .map(|row| row.record)
            .collect())
    }

    async fn last_updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .map(|row| row.updated_at)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: &str, date: NaiveDate, calls: i64) -> PerformanceRecord {
        PerformanceRecord {
            user_id: user_id.to_string(),
            user_name: user_id.to_uppercase(),
            date,
            daily_activities: 0,
            on_time: 95.0,
            leads_started: 0,
            leads_finished: 0,
            conversion_rate: 0.0,
            earnings: 0.0,
            calls,
            meetings_scheduled: 0,
            meetings_completed: 0,
            contracts_generated: 0,
            noshow: 0,
            closing: 0,
            lead_time: 0.0,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[tokio::test]
    async fn in_memory_upsert_overwrites_on_natural_key() {
        let store = InMemoryPerformanceStore::new();
        store.upsert(&[record("u1", day(2), 10)]).await.unwrap();
        store
            .upsert(&[record("u1", day(2), 25), record("u2", day(2), 3)])
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(store.get("u1", day(2)).await.unwrap().calls, 25);
        assert!(store.last_updated_at().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn in_memory_range_and_recent_queries_are_newest_first() {
        let store = InMemoryPerformanceStore::seeded(vec![
            record("u1", day(1), 1),
            record("u1", day(3), 3),
            record("u1", day(5), 5),
        ])
        .await;

        let between = store.records_between(day(2), day(5)).await.unwrap();
        assert_eq!(
            between.iter().map(|r| r.calls).collect::<Vec<_>>(),
            vec![5, 3]
        );

        let recent = store.most_recent(2).await.unwrap();
        assert_eq!(
            recent.iter().map(|r| r.date).collect::<Vec<_>>(),
            vec![day(5), day(3)]
        );
    }

    #[tokio::test]
    #[ignore = "integration: requires DATABASE_URL pointing at a disposable Postgres"]
    async fn integration_postgres_upsert_is_idempotent() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = PgPerformanceStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();

        let user = format!("it-{}", uuid::Uuid::new_v4());
        store.upsert(&[record(&user, day(9), 10)]).await.unwrap();
        store.upsert(&[record(&user, day(9), 42)]).await.unwrap();

        let rows = store.records_between(day(9), day(9)).await.unwrap();
        let mine = rows.iter().filter(|r| r.user_id == user).collect::<Vec<_>>();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].calls, 42);
    }
}
