//! Upsert writer and read access for the series tables.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use vdv_core::{AnalysisArtifact, CanonicalRecord, ColumnSpec, FailureKind, RecordKey, SeriesTable};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected for {table} {key}: {reason}")]
    WriteConflict {
        table: String,
        key: String,
        reason: String,
    },
    #[error("column `{column}` cannot be written on {table} by this operation")]
    InvalidColumn { table: String, column: String },
    #[error("store query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::WriteConflict { .. } => FailureKind::WriteConflict,
            StoreError::InvalidColumn { .. } => FailureKind::Config,
            StoreError::Unavailable(_) | StoreError::Query(_) => FailureKind::Store,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    SkippedDuplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BroadcastOutcome {
    Applied { codes: Vec<String>, rows: u64 },
    /// No row exists for the date yet; nothing was written.
    NoTargets,
}

#[async_trait]
pub trait SeriesStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert the row unless `(date, code)` already exists. Existing rows are never touched.
    async fn insert_if_absent(&self, record: &CanonicalRecord) -> Result<WriteOutcome, StoreError>;

    /// Write the broadcast columns of `table` on every row dated `date`, in one transaction.
    /// Every broadcast column is assigned: a column missing from `fields` is cleared, so all
    /// rows of the date end up with the same values. An empty `fields` writes nothing.
    async fn broadcast_update(
        &self,
        table: SeriesTable,
        date: NaiveDate,
        fields: &BTreeMap<String, f64>,
    ) -> Result<BroadcastOutcome, StoreError>;

    /// Rows dated on or before `until`, newest `limit` rows, returned oldest first.
    async fn recent_records(
        &self,
        table: SeriesTable,
        code: Option<&str>,
        until: NaiveDate,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError>;

    async fn records_for_date(
        &self,
        table: SeriesTable,
        date: NaiveDate,
    ) -> Result<Vec<CanonicalRecord>, StoreError>;

    async fn count_rows(&self, table: SeriesTable) -> Result<u64, StoreError>;

    async fn upsert_analysis(&self, artifact: &AnalysisArtifact) -> Result<(), StoreError>;

    async fn analysis_for(&self, date: NaiveDate) -> Result<Option<AnalysisArtifact>, StoreError>;
}

fn checked_columns(
    table: SeriesTable,
    names: impl Iterator<Item = String>,
    allowed: &'static [ColumnSpec],
) -> Result<Vec<&'static str>, StoreError> {
    names
        .map(|name| {
            allowed
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.name)
                .ok_or_else(|| StoreError::InvalidColumn {
                    table: table.to_string(),
                    column: name,
                })
        })
        .collect()
}

fn all_columns(table: SeriesTable) -> impl Iterator<Item = &'static str> {
    table
        .columns()
        .iter()
        .chain(table.broadcast_columns())
        .map(|c| c.name)
}

/// Postgres-backed store. Column names only ever come from the static table catalogue.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn select_list(table: SeriesTable) -> String {
        let mut list = format!("date, \"{}\"::text AS code, crawl_time", table.code_column());
        for column in all_columns(table) {
            list.push_str(&format!(", \"{column}\"::float8 AS \"{column}\""));
        }
        list
    }

    fn record_from_row(table: SeriesTable, row: &PgRow) -> Result<CanonicalRecord, sqlx::Error> {
        let mut values = BTreeMap::new();
        for column in all_columns(table) {
            if let Some(value) = row.try_get::<Option<f64>, _>(column)? {
                values.insert(column.to_string(), value);
            }
        }
        Ok(CanonicalRecord {
            table,
            key: RecordKey {
                date: row.try_get("date")?,
                code: row.try_get("code")?,
            },
            crawl_time: row.try_get("crawl_time")?,
            values,
        })
    }
}

fn map_sqlx(err: sqlx::Error, table: &str, key: impl FnOnce() -> String) -> StoreError {
    match err {
        sqlx::Error::Database(db) if !matches!(db.kind(), sqlx::error::ErrorKind::Other) => {
            StoreError::WriteConflict {
                table: table.to_string(),
                key: key(),
                reason: db.to_string(),
            }
        }
        other => map_read(other),
    }
}

fn map_read(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        other => StoreError::Query(other.to_string()),
    }
}

#[async_trait]
impl SeriesStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn insert_if_absent(&self, record: &CanonicalRecord) -> Result<WriteOutcome, StoreError> {
        let table = record.table;
        let columns = checked_columns(table, record.values.keys().cloned(), table.columns())?;

        let mut names = format!("date, \"{}\", crawl_time", table.code_column());
        let mut placeholders = "$1, $2, $3".to_string();
        for (i, column) in columns.iter().enumerate() {
            names.push_str(&format!(", \"{column}\""));
            placeholders.push_str(&format!(", ${}", i + 4));
        }
        let sql = format!(
            "INSERT INTO {table} ({names}) VALUES ({placeholders}) \
             ON CONFLICT (date, \"{code}\") DO NOTHING",
            code = table.code_column()
        );

        let mut query = sqlx::query(&sql)
            .bind(record.key.date)
            .bind(&record.key.code)
            .bind(record.crawl_time);
        for column in &columns {
            query = query.bind(record.value(column));
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|err| map_sqlx(err, table.table_name(), || record.key.to_string()))?;

        Ok(if result.rows_affected() == 1 {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::SkippedDuplicate
        })
    }

    async fn broadcast_update(
        &self,
        table: SeriesTable,
        date: NaiveDate,
        fields: &BTreeMap<String, f64>,
    ) -> Result<BroadcastOutcome, StoreError> {
        checked_columns(table, fields.keys().cloned(), table.broadcast_columns())?;
        if fields.is_empty() {
            return Ok(BroadcastOutcome::NoTargets);
        }
        let columns = table.broadcast_columns().iter().map(|c| c.name).collect::<Vec<_>>();
        let code = table.code_column();
        let key = || date.to_string();

        let mut tx = self.pool.begin().await.map_err(map_read)?;

        let locked_sql =
            format!("SELECT \"{code}\"::text FROM {table} WHERE date = $1 ORDER BY 1 FOR UPDATE");
        let mut codes: Vec<String> = sqlx::query_scalar(&locked_sql)
            .bind(date)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_read)?;
        codes.dedup();
        if codes.is_empty() {
            tx.rollback().await.map_err(map_read)?;
            return Ok(BroadcastOutcome::NoTargets);
        }

        let assignments = columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("\"{column}\" = ${}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let update_sql = format!("UPDATE {table} SET {assignments} WHERE date = $1");
        let mut query = sqlx::query(&update_sql).bind(date);
        for column in &columns {
            query = query.bind(fields.get(*column).copied());
        }
        let result = query
            .execute(&mut *tx)
            .await
            .map_err(|err| map_sqlx(err, table.table_name(), key))?;
        tx.commit().await.map_err(map_read)?;

        debug!(%table, %date, rows = result.rows_affected(), "broadcast applied");
        Ok(BroadcastOutcome::Applied {
            codes,
            rows: result.rows_affected(),
        })
    }

    async fn recent_records(
        &self,
        table: SeriesTable,
        code: Option<&str>,
        until: NaiveDate,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        let sql = format!(
            "SELECT {list} FROM {table} \
             WHERE date <= $1 AND ($2::text IS NULL OR \"{code_col}\" = $2) \
             ORDER BY date DESC, \"{code_col}\" LIMIT $3",
            list = Self::select_list(table),
            code_col = table.code_column()
        );
        let rows = sqlx::query(&sql)
            .bind(until)
            .bind(code)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_read)?;
        let mut records = rows
            .iter()
            .map(|row| Self::record_from_row(table, row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_read)?;
        records.reverse();
        Ok(records)
    }

    async fn records_for_date(
        &self,
        table: SeriesTable,
        date: NaiveDate,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        let sql = format!(
            "SELECT {list} FROM {table} WHERE date = $1 ORDER BY \"{code_col}\"",
            list = Self::select_list(table),
            code_col = table.code_column()
        );
        let rows = sqlx::query(&sql)
            .bind(date)
            .fetch_all(&self.pool)
            .await
            .map_err(map_read)?;
        rows.iter()
            .map(|row| Self::record_from_row(table, row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_read)
    }

    async fn count_rows(&self, table: SeriesTable) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(map_read)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn upsert_analysis(&self, artifact: &AnalysisArtifact) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO market_analysis
                (date, generated_at, content, global_data_points, domestic_data_points)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (date) DO UPDATE SET
                generated_at = EXCLUDED.generated_at,
                content = EXCLUDED.content,
                global_data_points = EXCLUDED.global_data_points,
                domestic_data_points = EXCLUDED.domestic_data_points
            "#,
        )
        .bind(artifact.date)
        .bind(artifact.generated_at)
        .bind(&artifact.content)
        .bind(artifact.global_data_points)
        .bind(artifact.domestic_data_points)
        .execute(&self.pool)
        .await
        .map_err(|err| map_sqlx(err, "market_analysis", || artifact.date.to_string()))?;
        Ok(())
    }

    async fn analysis_for(&self, date: NaiveDate) -> Result<Option<AnalysisArtifact>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT date, generated_at, content, global_data_points, domestic_data_points
            FROM market_analysis
            WHERE date = $1
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_read)?;

        row.map(|row| {
            Ok(AnalysisArtifact {
                date: row.try_get("date")?,
                generated_at: row.try_get::<DateTime<Utc>, _>("generated_at")?,
                content: row.try_get("content")?,
                global_data_points: row.try_get("global_data_points")?,
                domestic_data_points: row.try_get("domestic_data_points")?,
            })
        })
        .transpose()
        .map_err(map_read)
    }
}

/// Process-local store for dry runs and tests. Same write rules as [`PgStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<BTreeMap<SeriesTable, BTreeMap<RecordKey, CanonicalRecord>>>,
    analyses: Mutex<BTreeMap<NaiveDate, AnalysisArtifact>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate lost connectivity: every subsequent call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    pub async fn all_records(&self, table: SeriesTable) -> Vec<CanonicalRecord> {
        self.tables
            .lock()
            .await
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SeriesStore for InMemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn insert_if_absent(&self, record: &CanonicalRecord) -> Result<WriteOutcome, StoreError> {
        self.check()?;
        checked_columns(record.table, record.values.keys().cloned(), record.table.columns())?;
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(record.table).or_default();
        if rows.contains_key(&record.key) {
            return Ok(WriteOutcome::SkippedDuplicate);
        }
        rows.insert(record.key.clone(), record.clone());
        Ok(WriteOutcome::Inserted)
    }

    async fn broadcast_update(
        &self,
        table: SeriesTable,
        date: NaiveDate,
        fields: &BTreeMap<String, f64>,
    ) -> Result<BroadcastOutcome, StoreError> {
        self.check()?;
        checked_columns(table, fields.keys().cloned(), table.broadcast_columns())?;
        if fields.is_empty() {
            return Ok(BroadcastOutcome::NoTargets);
        }
        let mut tables = self.tables.lock().await;
        let mut codes = Vec::new();
        if let Some(rows) = tables.get_mut(&table) {
            for (key, record) in rows.iter_mut().filter(|(key, _)| key.date == date) {
                for column in table.broadcast_columns() {
                    match fields.get(column.name) {
                        Some(value) => record.values.insert(column.name.to_string(), *value),
                        None => record.values.remove(column.name),
                    };
                }
                codes.push(key.code.clone());
            }
        }
        if codes.is_empty() {
            return Ok(BroadcastOutcome::NoTargets);
        }
        Ok(BroadcastOutcome::Applied {
            rows: codes.len() as u64,
            codes,
        })
    }

    async fn recent_records(
        &self,
        table: SeriesTable,
        code: Option<&str>,
        until: NaiveDate,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;
        let Some(rows) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        let mut matching = rows
            .values()
            .filter(|r| r.key.date <= until)
            .filter(|r| code.map_or(true, |c| r.key.code == c))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.key.date.cmp(&a.key.date).then(a.key.code.cmp(&b.key.code)));
        matching.truncate(limit);
        matching.reverse();
        Ok(matching)
    }

    async fn records_for_date(
        &self,
        table: SeriesTable,
        date: NaiveDate,
    ) -> Result<Vec<CanonicalRecord>, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&table)
            .map(|rows| {
                rows.values()
                    .filter(|r| r.key.date == date)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_rows(&self, table: SeriesTable) -> Result<u64, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables.get(&table).map_or(0, |rows| rows.len() as u64))
    }

    async fn upsert_analysis(&self, artifact: &AnalysisArtifact) -> Result<(), StoreError> {
        self.check()?;
        self.analyses
            .lock()
            .await
            .insert(artifact.date, artifact.clone());
        Ok(())
    }

    async fn analysis_for(&self, date: NaiveDate) -> Result<Option<AnalysisArtifact>, StoreError> {
        self.check()?;
        Ok(self.analyses.lock().await.get(&date).cloned())
    }
}
