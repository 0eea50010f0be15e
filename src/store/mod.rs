//! Status store: analyses, jobs and findings.
//!
//! The only shared mutable state in the system. Analysis-level transitions
//! go through [`StatusStore::update_analysis_if`]; job rows are written only
//! by the worker that owns them.

pub mod sqlite;

use crate::error::StoreError;
use crate::models::{
    Analysis, AnalysisJob, AnalysisStatus, AnalysisUpdate, Finding, ModuleKind, NewAnalysis,
    NewFinding,
};
use async_trait::async_trait;

pub use sqlite::SqliteStatusStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert an analysis and one pending job per module in one transaction.
    async fn create_analysis(
        &self,
        analysis: &NewAnalysis,
        modules: &[ModuleKind],
    ) -> StoreResult<(Analysis, Vec<AnalysisJob>)>;

    /// Remove an analysis together with its jobs and findings.
    async fn discard_analysis(&self, analysis_id: &str) -> StoreResult<()>;

    async fn get_analysis(&self, analysis_id: &str) -> StoreResult<Option<Analysis>>;

    /// Number of non-terminal analyses owned by a tenant.
    async fn count_active_analyses(&self, tenant_id: &str) -> StoreResult<u64>;

    /// Compare-and-swap on the analysis status column.
    ///
    /// Returns `true` only if the row was in `expected` and now holds `new`
    /// together with the populated fields of `update`.
    async fn update_analysis_if(
        &self,
        analysis_id: &str,
        expected: AnalysisStatus,
        new: AnalysisStatus,
        update: AnalysisUpdate,
    ) -> StoreResult<bool>;

    async fn jobs_for_analysis(&self, analysis_id: &str) -> StoreResult<Vec<AnalysisJob>>;

    async fn job_for_module(
        &self,
        analysis_id: &str,
        module: ModuleKind,
    ) -> StoreResult<Option<AnalysisJob>>;

    /// Move a non-terminal job to running. `false` if it is already terminal.
    async fn start_job(&self, job_id: &str) -> StoreResult<bool>;

    /// Mark a running job completed and append its findings atomically.
    /// Nothing is written when the job is no longer running.
    async fn complete_job(
        &self,
        job_id: &str,
        findings: &[NewFinding],
        score: f64,
    ) -> StoreResult<bool>;

    /// Mark a non-terminal job failed.
    async fn fail_job(&self, job_id: &str, error: &str) -> StoreResult<bool>;

    /// Fail every still-pending job of an analysis. Returns how many changed.
    async fn fail_pending_jobs(&self, analysis_id: &str, error: &str) -> StoreResult<u64>;

    async fn findings_for_analysis(&self, analysis_id: &str) -> StoreResult<Vec<Finding>>;

    async fn findings_for_job(&self, job_id: &str) -> StoreResult<Vec<Finding>>;
}
