// src/store/sqlite.rs

//! SQLite-backed store.
//!
//! One connection sits behind a mutex. A [`SqliteTransaction`] holds the lock
//! for its whole lifetime and brackets its statements with `BEGIN IMMEDIATE`
//! and `COMMIT`. Dropping it uncommitted issues `ROLLBACK`.
//!
//! Timestamps are stored as RFC 3339 text with nanoseconds and a `Z` suffix.
//! The fixed width keeps them ordered as text and exact under the product key
//! constraint.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, trace, warn};

use super::{JobFilter, ProductFilter, Store, StoreRead, Transaction};
use crate::errors::{ReductorError, Result};
use crate::model::{
    Job, JobId, JobState, NewJob, NewProduct, Product, ProductId, ProductState, Relationship,
    RelationshipId,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  stage TEXT NOT NULL,
  job_type TEXT NOT NULL,
  state TEXT NOT NULL,
  priority INTEGER NOT NULL,
  is_backfill INTEGER NOT NULL,
  creation_time TEXT NOT NULL,
  launch_time TEXT,
  start_time TEXT,
  end_time TEXT,
  run_name TEXT,
  run_id TEXT,
  call_parameters TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, stage);

CREATE TABLE IF NOT EXISTS products (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  stage TEXT NOT NULL,
  product_type TEXT NOT NULL,
  source TEXT NOT NULL,
  version INTEGER NOT NULL,
  observation_time TEXT NOT NULL,
  state TEXT NOT NULL,
  creation_time TEXT NOT NULL,
  producing_job_id INTEGER REFERENCES jobs(id),
  outlier INTEGER NOT NULL,
  quality_flags INTEGER NOT NULL,
  UNIQUE (stage, product_type, source, version, observation_time)
);
CREATE INDEX IF NOT EXISTS idx_products_job ON products(producing_job_id);
CREATE INDEX IF NOT EXISTS idx_products_stage_state ON products(stage, state);

CREATE TABLE IF NOT EXISTS relationships (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_id INTEGER NOT NULL REFERENCES products(id),
  child_id INTEGER NOT NULL REFERENCES products(id)
);
CREATE INDEX IF NOT EXISTS idx_relationships_parent ON relationships(parent_id);
CREATE INDEX IF NOT EXISTS idx_relationships_child ON relationships(child_id);
"#;

const PRODUCT_COLUMNS: &str = "id, stage, product_type, source, version, observation_time, \
     state, creation_time, producing_job_id, outlier, quality_flags";

const JOB_COLUMNS: &str = "id, stage, job_type, state, priority, is_backfill, creation_time, \
     launch_time, start_time, end_time, run_name, run_id, call_parameters";

/// Store backed by a SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open the database at `path`, creating the file, its directory and the
    /// schema when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(path = ?path, journal_mode = %mode, "opened sqlite store");
        Self::with_connection(conn)
    }

    /// A private database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ReductorError::Other(anyhow!("sqlite store lock poisoned")))
    }
}

impl Store for SqliteStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            committed: false,
        }))
    }
}

/// Transaction over a [`SqliteStore`].
pub struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    committed: bool,
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "sqlite rollback failed");
            }
        }
    }
}

impl SqliteTransaction<'_> {
    fn query_products(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Product>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params_from_iter(values), read_product)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_jobs(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params_from_iter(values), read_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_relationships(&self, column: &str, product: ProductId) -> Result<Vec<Relationship>> {
        let sql = format!(
            "SELECT id, parent_id, child_id FROM relationships WHERE {column} = ?1 ORDER BY id"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![product], |row| {
            Ok(Relationship {
                id: row.get(0)?,
                parent_id: row.get(1)?,
                child_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl StoreRead for SqliteTransaction<'_> {
    fn product(&self, id: ProductId) -> Result<Option<Product>> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], read_product)
            .optional()?)
    }

    fn find_products(&self, filter: &ProductFilter) -> Result<Vec<Product>> {
        let (conditions, values) = product_conditions(filter);
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products{conditions} ORDER BY id");
        self.query_products(&sql, values)
    }

    fn products_for_job(&self, job_id: JobId) -> Result<Vec<Product>> {
        let sql =
            format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE producing_job_id = ? ORDER BY id");
        self.query_products(&sql, vec![Value::Integer(job_id)])
    }

    fn job(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![id], read_job).optional()?)
    }

    fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let (conditions, values) = job_conditions(filter);
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs{conditions} ORDER BY id");
        self.query_jobs(&sql, values)
    }

    fn count_jobs(&self, filter: &JobFilter) -> Result<usize> {
        let (conditions, values) = job_conditions(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs{conditions}");
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn relationships_for_child(&self, child: ProductId) -> Result<Vec<Relationship>> {
        self.query_relationships("child_id", child)
    }

    fn relationships_for_parent(&self, parent: ProductId) -> Result<Vec<Relationship>> {
        self.query_relationships("parent_id", parent)
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn as_read(&self) -> &dyn StoreRead {
        self
    }

    fn insert_product(&mut self, product: NewProduct) -> Result<ProductId> {
        let key = &product.key;
        self.conn.execute(
            "INSERT INTO products (id, stage, product_type, source, version, observation_time, \
             state, creation_time, producing_job_id, outlier, quality_flags) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                product.id,
                key.stage,
                key.product_type,
                key.source,
                key.version,
                encode_time(&key.observation_time),
                product.state.as_str(),
                encode_time(&product.creation_time),
                product.producing_job_id,
                product.outlier,
                product.quality_flags,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        trace!(product_id = id, "inserted product");
        Ok(id)
    }

    fn update_product(&mut self, product: &Product) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE products SET stage = ?2, product_type = ?3, source = ?4, version = ?5, \
             observation_time = ?6, state = ?7, creation_time = ?8, producing_job_id = ?9, \
             outlier = ?10, quality_flags = ?11 WHERE id = ?1",
            params![
                product.id,
                product.stage,
                product.product_type,
                product.source,
                product.version,
                encode_time(&product.observation_time),
                product.state.as_str(),
                encode_time(&product.creation_time),
                product.producing_job_id,
                product.outlier,
                product.quality_flags,
            ],
        )?;
        if changed == 0 {
            return Err(ReductorError::ProductNotFound(product.id));
        }
        Ok(())
    }

    fn delete_product(&mut self, id: ProductId) -> Result<()> {
        match self
            .conn
            .execute("DELETE FROM products WHERE id = ?1", params![id])?
        {
            0 => Err(ReductorError::ProductNotFound(id)),
            _ => Ok(()),
        }
    }

    fn insert_job(&mut self, job: NewJob) -> Result<JobId> {
        self.conn.execute(
            "INSERT INTO jobs (stage, job_type, state, priority, is_backfill, creation_time, \
             call_parameters) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.stage,
                job.job_type,
                JobState::Planned.as_str(),
                job.priority,
                job.is_backfill,
                encode_time(&job.creation_time),
                job.call_parameters,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        trace!(job_id = id, "inserted job");
        Ok(id)
    }

    fn update_job(&mut self, job: &Job) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE jobs SET stage = ?2, job_type = ?3, state = ?4, priority = ?5, \
             is_backfill = ?6, creation_time = ?7, launch_time = ?8, start_time = ?9, \
             end_time = ?10, run_name = ?11, run_id = ?12, call_parameters = ?13 WHERE id = ?1",
            params![
                job.id,
                job.stage,
                job.job_type,
                job.state.as_str(),
                job.priority,
                job.is_backfill,
                encode_time(&job.creation_time),
                job.launch_time.as_ref().map(encode_time),
                job.start_time.as_ref().map(encode_time),
                job.end_time.as_ref().map(encode_time),
                job.run_name,
                job.run_id,
                job.call_parameters,
            ],
        )?;
        if changed == 0 {
            return Err(ReductorError::JobNotFound(job.id));
        }
        Ok(())
    }

    fn delete_job(&mut self, id: JobId) -> Result<()> {
        match self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])?
        {
            0 => Err(ReductorError::JobNotFound(id)),
            _ => Ok(()),
        }
    }

    fn insert_relationship(
        &mut self,
        parent: ProductId,
        child: ProductId,
    ) -> Result<RelationshipId> {
        self.conn.execute(
            "INSERT INTO relationships (parent_id, child_id) VALUES (?1, ?2)",
            params![parent, child],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn delete_relationships_touching(&mut self, product: ProductId) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM relationships WHERE parent_id = ?1 OR child_id = ?1",
            params![product],
        )?)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }
}

fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    decode_time(idx, &raw)
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| decode_time(idx, &raw)).transpose()
}

fn state_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|err: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into()))
}

fn read_product(row: &Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        stage: row.get(1)?,
        product_type: row.get(2)?,
        source: row.get(3)?,
        version: row.get(4)?,
        observation_time: time_column(row, 5)?,
        state: state_column::<ProductState>(row, 6)?,
        creation_time: time_column(row, 7)?,
        producing_job_id: row.get(8)?,
        outlier: row.get(9)?,
        quality_flags: row.get(10)?,
    })
}

fn read_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        stage: row.get(1)?,
        job_type: row.get(2)?,
        state: state_column::<JobState>(row, 3)?,
        priority: row.get(4)?,
        is_backfill: row.get(5)?,
        creation_time: time_column(row, 6)?,
        launch_time: optional_time_column(row, 7)?,
        start_time: optional_time_column(row, 8)?,
        end_time: optional_time_column(row, 9)?,
        run_name: row.get(10)?,
        run_id: row.get(11)?,
        call_parameters: row.get(12)?,
    })
}

/// Accumulates `WHERE` terms and their positional values.
#[derive(Default)]
struct Conditions {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Conditions {
    fn push(&mut self, clause: &str, value: Value) {
        self.clauses.push(clause.to_string());
        self.values.push(value);
    }

    fn push_in(&mut self, column: &str, items: impl IntoIterator<Item = &'static str>) {
        let values: Vec<Value> = items
            .into_iter()
            .map(|item| Value::Text(item.to_string()))
            .collect();
        if values.is_empty() {
            return;
        }
        let marks = vec!["?"; values.len()].join(", ");
        self.clauses.push(format!("{column} IN ({marks})"));
        self.values.extend(values);
    }

    fn finish(self) -> (String, Vec<Value>) {
        if self.clauses.is_empty() {
            return (String::new(), self.values);
        }
        (format!(" WHERE {}", self.clauses.join(" AND ")), self.values)
    }
}

fn product_conditions(filter: &ProductFilter) -> (String, Vec<Value>) {
    let mut conditions = Conditions::default();
    if let Some(stage) = &filter.stage {
        conditions.push("stage = ?", Value::Text(stage.clone()));
    }
    if let Some(product_type) = &filter.product_type {
        conditions.push("product_type = ?", Value::Text(product_type.clone()));
    }
    if let Some(source) = &filter.source {
        conditions.push("source = ?", Value::Text(source.clone()));
    }
    conditions.push_in("state", filter.states.iter().map(ProductState::as_str));
    if let Some(from) = &filter.observed_from {
        conditions.push("observation_time >= ?", Value::Text(encode_time(from)));
    }
    if let Some(before) = &filter.observed_before {
        conditions.push("observation_time < ?", Value::Text(encode_time(before)));
    }
    conditions.finish()
}

fn job_conditions(filter: &JobFilter) -> (String, Vec<Value>) {
    let mut conditions = Conditions::default();
    if let Some(stage) = &filter.stage {
        conditions.push("stage = ?", Value::Text(stage.clone()));
    }
    if let Some(job_type) = &filter.job_type {
        conditions.push("job_type = ?", Value::Text(job_type.clone()));
    }
    conditions.push_in("state", filter.states.iter().map(JobState::as_str));
    if let Some(cutoff) = &filter.created_before {
        conditions.push("creation_time < ?", Value::Text(encode_time(cutoff)));
    }
    if let Some(cutoff) = &filter.launched_before {
        conditions.push(
            "launch_time IS NOT NULL AND launch_time < ?",
            Value::Text(encode_time(cutoff)),
        );
    }
    conditions.finish()
}
