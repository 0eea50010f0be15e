//! SQLite-backed status store.
//!
//! Status columns hold the `as_str()` form of the enums; timestamps are
//! stored by sqlx's chrono support.

use super::{StatusStore, StoreResult};
use crate::error::StoreError;
use crate::models::{
    Analysis, AnalysisJob, AnalysisStatus, AnalysisUpdate, Finding, JobStatus, ModuleKind,
    NewAnalysis, NewFinding, Severity,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS analyses (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    target_url TEXT NOT NULL,
    asset_path TEXT NOT NULL,
    status TEXT NOT NULL,
    score REAL,
    findings_count INTEGER,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_analyses_tenant_status
ON analyses(tenant_id, status);

CREATE TABLE IF NOT EXISTS analysis_jobs (
    id TEXT PRIMARY KEY,
    analysis_id TEXT NOT NULL REFERENCES analyses(id) ON DELETE CASCADE,
    module TEXT NOT NULL,
    status TEXT NOT NULL,
    score REAL,
    started_at TEXT,
    completed_at TEXT,
    error TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    UNIQUE (analysis_id, module)
);

CREATE TABLE IF NOT EXISTS findings (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES analysis_jobs(id) ON DELETE CASCADE,
    analysis_id TEXT NOT NULL REFERENCES analyses(id) ON DELETE CASCADE,
    module TEXT NOT NULL,
    rule_key TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    severity TEXT NOT NULL,
    location TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_findings_analysis ON findings(analysis_id);
CREATE INDEX IF NOT EXISTS idx_findings_job ON findings(job_id);
"#;

const ANALYSIS_COLUMNS: &str = "id, tenant_id, target_url, asset_path, status, score, \
     findings_count, error, created_at, updated_at, completed_at";

const JOB_COLUMNS: &str =
    "id, analysis_id, module, status, score, started_at, completed_at, error, attempts";

const FINDING_COLUMNS: &str = "id, job_id, analysis_id, module, rule_key, rule_id, severity, \
     location, message, created_at";

/// Status store on top of a sqlx SQLite pool.
#[derive(Clone)]
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    /// Open (creating if needed) a database file and initialize the schema.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(busy_timeout + Duration::from_secs(5))
            .connect_with(options)
            .await?;

        info!("Connected to status store: {}", database_url);

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// A private in-memory database. One connection, never recycled, since
    /// every SQLite connection to `:memory:` sees its own database.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist.
    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        debug!("Status store schema ready");
        Ok(())
    }

    fn row_to_analysis(row: &SqliteRow) -> StoreResult<Analysis> {
        let status: String = row.try_get("status")?;

        Ok(Analysis {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            target_url: row.try_get("target_url")?,
            asset_path: row.try_get("asset_path")?,
            status: AnalysisStatus::from_str(&status).map_err(StoreError::Corrupt)?,
            score: row.try_get("score")?,
            findings_count: row.try_get("findings_count")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_job(row: &SqliteRow) -> StoreResult<AnalysisJob> {
        let module: String = row.try_get("module")?;
        let status: String = row.try_get("status")?;

        Ok(AnalysisJob {
            id: row.try_get("id")?,
            analysis_id: row.try_get("analysis_id")?,
            module: ModuleKind::from_str(&module).map_err(StoreError::Corrupt)?,
            status: JobStatus::from_str(&status).map_err(StoreError::Corrupt)?,
            score: row.try_get("score")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
        })
    }

    fn row_to_finding(row: &SqliteRow) -> StoreResult<Finding> {
        let module: String = row.try_get("module")?;
        let severity: String = row.try_get("severity")?;

        Ok(Finding {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            analysis_id: row.try_get("analysis_id")?,
            module: ModuleKind::from_str(&module).map_err(StoreError::Corrupt)?,
            rule_key: row.try_get("rule_key")?,
            rule_id: row.try_get("rule_id")?,
            severity: Severity::from_str(&severity).map_err(StoreError::Corrupt)?,
            location: row.try_get("location")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn create_analysis(
        &self,
        analysis: &NewAnalysis,
        modules: &[ModuleKind],
    ) -> StoreResult<(Analysis, Vec<AnalysisJob>)> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO analyses
             (id, tenant_id, target_url, asset_path, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&analysis.id)
        .bind(&analysis.tenant_id)
        .bind(&analysis.target_url)
        .bind(&analysis.asset_path)
        .bind(AnalysisStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut jobs = Vec::with_capacity(modules.len());
        for module in modules {
            let job = AnalysisJob {
                id: uuid::Uuid::new_v4().to_string(),
                analysis_id: analysis.id.clone(),
                module: *module,
                status: JobStatus::Pending,
                score: None,
                started_at: None,
                completed_at: None,
                error: None,
                attempts: 0,
            };

            sqlx::query(
                "INSERT INTO analysis_jobs (id, analysis_id, module, status)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&job.id)
            .bind(&job.analysis_id)
            .bind(job.module.id())
            .bind(job.status.as_str())
            .execute(&mut *tx)
            .await?;

            jobs.push(job);
        }

        tx.commit().await?;

        let created = Analysis {
            id: analysis.id.clone(),
            tenant_id: analysis.tenant_id.clone(),
            target_url: analysis.target_url.clone(),
            asset_path: analysis.asset_path.clone(),
            status: AnalysisStatus::Pending,
            score: None,
            findings_count: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        Ok((created, jobs))
    }

    async fn discard_analysis(&self, analysis_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM findings WHERE analysis_id = ?")
            .bind(analysis_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM analysis_jobs WHERE analysis_id = ?")
            .bind(analysis_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM analyses WHERE id = ?")
            .bind(analysis_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_analysis(&self, analysis_id: &str) -> StoreResult<Option<Analysis>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM analyses WHERE id = ?",
            ANALYSIS_COLUMNS
        ))
        .bind(analysis_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_analysis).transpose()
    }

    async fn count_active_analyses(&self, tenant_id: &str) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM analyses
             WHERE tenant_id = ? AND status IN (?, ?, ?)",
        )
        .bind(tenant_id)
        .bind(AnalysisStatus::Pending.as_str())
        .bind(AnalysisStatus::Fetching.as_str())
        .bind(AnalysisStatus::Analyzing.as_str())
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }

    async fn update_analysis_if(
        &self,
        analysis_id: &str,
        expected: AnalysisStatus,
        new: AnalysisStatus,
        update: AnalysisUpdate,
    ) -> StoreResult<bool> {
        // Terminal rows never change, whatever the caller expects.
        if expected.is_terminal() {
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE analyses
             SET status = ?,
                 updated_at = ?,
                 score = COALESCE(?, score),
                 findings_count = COALESCE(?, findings_count),
                 error = COALESCE(?, error),
                 completed_at = COALESCE(?, completed_at)
             WHERE id = ? AND status = ?",
        )
        .bind(new.as_str())
        .bind(Utc::now())
        .bind(update.score)
        .bind(update.findings_count)
        .bind(update.error)
        .bind(update.completed_at)
        .bind(analysis_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn jobs_for_analysis(&self, analysis_id: &str) -> StoreResult<Vec<AnalysisJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM analysis_jobs WHERE analysis_id = ? ORDER BY module ASC",
            JOB_COLUMNS
        ))
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn job_for_module(
        &self,
        analysis_id: &str,
        module: ModuleKind,
    ) -> StoreResult<Option<AnalysisJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM analysis_jobs WHERE analysis_id = ? AND module = ?",
            JOB_COLUMNS
        ))
        .bind(analysis_id)
        .bind(module.id())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn start_job(&self, job_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE analysis_jobs
             SET status = ?, started_at = ?, attempts = attempts + 1
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(JobStatus::Running.as_str())
        .bind(Utc::now())
        .bind(job_id)
        .bind(JobStatus::Pending.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_job(
        &self,
        job_id: &str,
        findings: &[NewFinding],
        score: f64,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock from the start.
        let result = sqlx::query(
            "UPDATE analysis_jobs
             SET status = ?, score = ?, completed_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Completed.as_str())
        .bind(score)
        .bind(now)
        .bind(job_id)
        .bind(JobStatus::Running.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        let row = sqlx::query("SELECT analysis_id, module FROM analysis_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        let analysis_id: String = row.try_get("analysis_id")?;
        let module: String = row.try_get("module")?;

        for finding in findings {
            sqlx::query(
                "INSERT INTO findings
                 (id, job_id, analysis_id, module, rule_key, rule_id, severity,
                  location, message, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(job_id)
            .bind(&analysis_id)
            .bind(&module)
            .bind(&finding.rule_key)
            .bind(&finding.rule_id)
            .bind(finding.severity.as_str())
            .bind(&finding.location)
            .bind(&finding.message)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn fail_job(&self, job_id: &str, error: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE analysis_jobs
             SET status = ?, error = ?, completed_at = ?
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .bind(JobStatus::Pending.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_pending_jobs(&self, analysis_id: &str, error: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE analysis_jobs
             SET status = ?, error = ?, completed_at = ?
             WHERE analysis_id = ? AND status = ?",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(analysis_id)
        .bind(JobStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn findings_for_analysis(&self, analysis_id: &str) -> StoreResult<Vec<Finding>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM findings WHERE analysis_id = ? ORDER BY module ASC, created_at ASC",
            FINDING_COLUMNS
        ))
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_finding).collect()
    }

    async fn findings_for_job(&self, job_id: &str) -> StoreResult<Vec<Finding>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM findings WHERE job_id = ? ORDER BY created_at ASC",
            FINDING_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_finding).collect()
    }
}
