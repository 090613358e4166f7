//! SQLite-backed job store.
//!
//! Holds everything this subsystem persists: job rows and their message log,
//! the per-document ledger, the authoritative and working distribution
//! snapshots, push history and first-publication dates.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::{PublishError, Result};
use crate::scheduler::{JobRecord, JobStatus, RequestedDocument};

mod models;

pub use models::{LedgerEntry, PushRecord, SnapshotEntry, SnapshotRow};

use models::{parse_time, JobRow};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pub_job (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        system TEXT NOT NULL,
        subset TEXT NOT NULL,
        started TEXT NOT NULL,
        output_dir TEXT NOT NULL,
        user TEXT NOT NULL,
        email TEXT,
        parameters TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL,
        messages TEXT NOT NULL DEFAULT '',
        completed TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pub_job_request (
        job_id INTEGER NOT NULL REFERENCES pub_job(id),
        doc_id INTEGER NOT NULL,
        version INTEGER,
        PRIMARY KEY (job_id, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pub_job_doc (
        job_id INTEGER NOT NULL REFERENCES pub_job(id),
        doc_id INTEGER NOT NULL,
        version INTEGER NOT NULL,
        doctype TEXT NOT NULL,
        subdir TEXT,
        filename TEXT,
        messages TEXT,
        failure INTEGER NOT NULL DEFAULT 0,
        removed INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (job_id, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshot (
        doc_id INTEGER PRIMARY KEY,
        version INTEGER NOT NULL,
        doctype TEXT NOT NULL,
        content TEXT NOT NULL,
        job_id INTEGER NOT NULL,
        force_push INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshot_work (
        job_id INTEGER NOT NULL,
        doc_id INTEGER NOT NULL,
        version INTEGER NOT NULL,
        doctype TEXT NOT NULL,
        content TEXT,
        group_num INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (job_id, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS push_history (
        job_id INTEGER PRIMARY KEY,
        doc_count INTEGER NOT NULL,
        pushed_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS first_pub (
        doc_id INTEGER PRIMARY KEY,
        first_pub TEXT NOT NULL
    )
    "#,
];

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the store at `url` and ensure the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory store. One connection, so every query sees the
    /// same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Insert a job row. An `id` of 0 lets the database assign one.
    /// Returns the job's id.
    pub async fn create_job(&self, record: &JobRecord) -> Result<i64> {
        let parameters = serde_json::to_string(&record.parameters)?;
        let id = if record.id > 0 { Some(record.id) } else { None };
        let result = sqlx::query(
            r#"
            INSERT INTO pub_job
                (id, system, subset, started, output_dir, user, email, parameters, status, messages)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&record.system)
        .bind(&record.subset)
        .bind(record.started.to_rfc3339())
        .bind(record.output_dir.to_string_lossy().into_owned())
        .bind(&record.user)
        .bind(&record.email)
        .bind(parameters)
        .bind(record.status.as_str())
        .bind(&record.messages)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn add_requested(&self, job_id: i64, docs: &[RequestedDocument]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for doc in docs {
            sqlx::query(
                "INSERT OR IGNORE INTO pub_job_request (job_id, doc_id, version) VALUES (?, ?, ?)",
            )
            .bind(job_id)
            .bind(doc.doc_id)
            .bind(doc.version)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn job(&self, job_id: i64) -> Result<JobRecord> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM pub_job WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PublishError::JobNotFound(job_id))?
            .try_into()
    }

    pub async fn recent_jobs(&self, limit: i64) -> Result<Vec<JobRecord>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM pub_job ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(JobRecord::try_from)
            .collect()
    }

    pub async fn requested_documents(&self, job_id: i64) -> Result<Vec<RequestedDocument>> {
        let rows: Vec<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT doc_id, version FROM pub_job_request WHERE job_id = ? ORDER BY rowid",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(doc_id, version)| RequestedDocument { doc_id, version })
            .collect())
    }

    pub async fn status(&self, job_id: i64) -> Result<JobStatus> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM pub_job WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        status
            .ok_or(PublishError::JobNotFound(job_id))?
            .parse()
            .map_err(PublishError::Internal)
    }

    /// Set the job's status, appending `message` to its log. A job that has
    /// reached `Success` or `Failure` is never modified again; returns false
    /// in that case.
    pub async fn update_status(
        &self,
        job_id: i64,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let completed = status.is_terminal().then(|| Utc::now().to_rfc3339());
        let result = sqlx::query(
            r#"
            UPDATE pub_job
               SET status = ?,
                   messages = messages || ?,
                   completed = COALESCE(?, completed)
             WHERE id = ? AND status NOT IN ('Success', 'Failure')
            "#,
        )
        .bind(status.as_str())
        .bind(message.map(log_line).unwrap_or_default())
        .bind(completed)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Append to the job's message log without touching its status.
    pub async fn append_message(&self, job_id: i64, message: &str) -> Result<()> {
        sqlx::query("UPDATE pub_job SET messages = messages || ? WHERE id = ?")
            .bind(log_line(message))
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace one stored job parameter.
    pub async fn set_parameter(&self, job_id: i64, name: &str, value: &str) -> Result<()> {
        let mut record = self.job(job_id).await?;
        record.parameters.insert(name.to_string(), value.to_string());
        sqlx::query("UPDATE pub_job SET parameters = ? WHERE id = ?")
            .bind(serde_json::to_string(&record.parameters)?)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    pub async fn record_document(&self, job_id: i64, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pub_job_doc
                (job_id, doc_id, version, doctype, subdir, filename, messages, failure, removed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(entry.doc_id)
        .bind(entry.version)
        .bind(&entry.doctype)
        .bind(&entry.subdir)
        .bind(&entry.filename)
        .bind(&entry.messages)
        .bind(entry.failure)
        .bind(entry.removed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ledger(&self, job_id: i64) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT doc_id, version, doctype, subdir, filename, messages, failure, removed
              FROM pub_job_doc
             WHERE job_id = ?
             ORDER BY doc_id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Distribution snapshot
    // ------------------------------------------------------------------

    pub async fn snapshot(&self) -> Result<Vec<SnapshotRow>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT doc_id, version, doctype, content, job_id, force_push FROM snapshot ORDER BY doc_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_force_push(&self, doc_id: i64, force: bool) -> Result<()> {
        sqlx::query("UPDATE snapshot SET force_push = ? WHERE doc_id = ?")
            .bind(force)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the job's working snapshot with `entries`.
    pub async fn write_work(&self, job_id: i64, entries: &[SnapshotEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM snapshot_work WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO snapshot_work (job_id, doc_id, version, doctype, content, group_num)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job_id)
            .bind(entry.doc_id)
            .bind(entry.version)
            .bind(&entry.doctype)
            .bind(&entry.content)
            .bind(entry.group_num)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn work(&self, job_id: i64) -> Result<Vec<SnapshotEntry>> {
        let rows = sqlx::query_as::<_, SnapshotEntry>(
            r#"
            SELECT doc_id, version, doctype, content, group_num
              FROM snapshot_work
             WHERE job_id = ?
             ORDER BY doc_id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Promote the job's working snapshot into the authoritative one and
    /// record the push, all in one transaction: removals are deleted, then
    /// changed documents updated, then new documents inserted. With
    /// `replace_all` the authoritative snapshot is cleared first.
    ///
    /// Removals the job did not select itself are added to its ledger as
    /// removed documents. Returns the number of documents pushed.
    pub async fn merge_snapshot(&self, job_id: i64, replace_all: bool) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshot_work WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;

        if replace_all {
            sqlx::query("DELETE FROM snapshot").execute(&mut *tx).await?;
        }

        sqlx::query(
            r#"
            DELETE FROM snapshot
             WHERE doc_id IN (SELECT doc_id
                                FROM snapshot_work
                               WHERE job_id = ? AND content IS NULL)
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO pub_job_doc (job_id, doc_id, version, doctype, failure, removed)
            SELECT job_id, doc_id, version, doctype, 0, 1
              FROM snapshot_work
             WHERE job_id = ? AND content IS NULL
             ORDER BY doc_id
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE snapshot
               SET version = w.version,
                   doctype = w.doctype,
                   content = w.content,
                   job_id = w.job_id,
                   force_push = 0
              FROM snapshot_work AS w
             WHERE w.doc_id = snapshot.doc_id
               AND w.job_id = ?
               AND w.content IS NOT NULL
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO snapshot (doc_id, version, doctype, content, job_id, force_push)
            SELECT w.doc_id, w.version, w.doctype, w.content, w.job_id, 0
              FROM snapshot_work AS w
             WHERE w.job_id = ?
               AND w.content IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM snapshot AS s WHERE s.doc_id = w.doc_id)
             ORDER BY w.doc_id
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO push_history (job_id, doc_count, pushed_at) VALUES (?, ?, ?)")
            .bind(job_id)
            .bind(count)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM snapshot_work WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(count as usize)
    }

    /// Drop a job's working snapshot without merging it.
    pub async fn discard_work(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM snapshot_work WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent job whose push the gateway confirmed.
    pub async fn last_pushed_job(&self) -> Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar("SELECT MAX(job_id) FROM push_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn push_history(&self) -> Result<Vec<PushRecord>> {
        let rows = sqlx::query_as::<_, PushRecord>(
            "SELECT job_id, doc_count, pushed_at FROM push_history ORDER BY job_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // First publication
    // ------------------------------------------------------------------

    pub async fn first_pub_dates(&self) -> Result<HashMap<i64, DateTime<Utc>>> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT doc_id, first_pub FROM first_pub")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(doc_id, date)| Ok((doc_id, parse_time(&date)?)))
            .collect()
    }

    /// Record `when` as the first-publication date of every document this
    /// job published that has none yet. Returns how many were new.
    pub async fn record_first_pub(&self, job_id: i64, when: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO first_pub (doc_id, first_pub)
            SELECT doc_id, ? FROM pub_job_doc
             WHERE job_id = ? AND failure = 0 AND removed = 0
            "#,
        )
        .bind(when.to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn log_line(message: &str) -> String {
    format!("[{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), message)
}
