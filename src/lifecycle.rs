//! Shared job lifecycle for every analysis module.
//!
//! Analyzers only see the captured assets and return findings. Moving the
//! job through `pending -> running -> completed | failed`, persisting the
//! findings and reporting the terminal transition happen here, once, for
//! all modules.

use crate::aggregator::{AggregationOutcome, CompletionAggregator};
use crate::analyzers::{Analyzer, RuleCatalog};
use crate::assets::{load_bundle, AssetStore};
use crate::error::{AssetError, StoreError, TaskError};
use crate::models::{AnalysisJob, AnalysisStatus};
use crate::queue::ModuleTask;
use crate::retry::RetryPolicy;
use crate::store::{StatusStore, StoreResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CANCELLED: &str = "analysis cancelled";

/// What a single module task run amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { findings: usize, score: f64 },
    Failed(String),
    /// The job was already terminal; nothing changed.
    Duplicate,
}

pub struct JobLifecycle {
    store: Arc<dyn StatusStore>,
    assets: Arc<dyn AssetStore>,
    aggregator: Arc<CompletionAggregator>,
    catalog: Arc<RuleCatalog>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl JobLifecycle {
    pub fn new(
        store: Arc<dyn StatusStore>,
        assets: Arc<dyn AssetStore>,
        aggregator: Arc<CompletionAggregator>,
        catalog: Arc<RuleCatalog>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            assets,
            aggregator,
            catalog,
            retry,
            timeout,
        }
    }

    /// Run `analyzer` for one module task.
    pub async fn run(
        &self,
        analyzer: &dyn Analyzer,
        task: &ModuleTask,
    ) -> Result<JobOutcome, TaskError> {
        let job = self
            .store_op("load job", || {
                self.store.job_for_module(&task.analysis_id, task.module)
            })
            .await?
            .ok_or_else(|| {
                TaskError::Terminal(format!(
                    "no {} job for analysis {}",
                    task.module, task.analysis_id
                ))
            })?;

        if job.status.is_terminal() {
            debug!(job_id = %job.id, status = %job.status, "Job already terminal");
            // Covers a crash between the job write and the aggregation.
            self.notify(&job.analysis_id).await?;
            return Ok(JobOutcome::Duplicate);
        }

        if !self.store_op("start job", || self.store.start_job(&job.id)).await? {
            return Ok(JobOutcome::Duplicate);
        }
        info!(
            analysis_id = %job.analysis_id,
            job_id = %job.id,
            module = %job.module,
            attempt = job.attempts + 1,
            "Job running"
        );

        if self.is_cancelled(&job.analysis_id).await? {
            return self.fail(&job, CANCELLED.to_string()).await;
        }

        let loaded = self
            .retry
            .run("load assets", AssetError::is_retryable, || {
                load_bundle(self.assets.as_ref(), &task.asset_path)
            })
            .await;
        let bundle = match loaded {
            Ok(bundle) => bundle,
            Err(e) => return self.fail(&job, e.to_string()).await,
        };

        let raw = match tokio::time::timeout(self.timeout, analyzer.analyze(&bundle)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return self.fail(&job, format!("{:#}", e)).await,
            Err(_) => {
                let message = format!("analysis timed out after {}", describe(self.timeout));
                return self.fail(&job, message).await;
            }
        };

        if self.is_cancelled(&job.analysis_id).await? {
            return self.fail(&job, CANCELLED.to_string()).await;
        }

        let findings = self.catalog.resolve(job.module, raw);
        let score = analyzer.score(&findings);

        let applied = self
            .store_op("complete job", || {
                self.store.complete_job(&job.id, &findings, score)
            })
            .await?;

        let outcome = if applied {
            info!(
                analysis_id = %job.analysis_id,
                job_id = %job.id,
                module = %job.module,
                findings = findings.len(),
                score,
                "Job completed"
            );
            JobOutcome::Completed {
                findings: findings.len(),
                score,
            }
        } else {
            JobOutcome::Duplicate
        };

        self.notify(&job.analysis_id).await?;
        Ok(outcome)
    }

    /// Give up on a module task that will not be delivered again: fail its
    /// job if still open and let the aggregator finalize the analysis.
    pub async fn abandon(&self, task: &ModuleTask, reason: &str) -> Result<(), TaskError> {
        let Some(job) = self
            .store_op("load job", || {
                self.store.job_for_module(&task.analysis_id, task.module)
            })
            .await?
        else {
            return Ok(());
        };

        if job.status.is_terminal() {
            self.notify(&job.analysis_id).await?;
        } else {
            self.fail(&job, format!("task abandoned: {}", reason)).await?;
        }
        Ok(())
    }

    async fn fail(&self, job: &AnalysisJob, message: String) -> Result<JobOutcome, TaskError> {
        let applied = self
            .store_op("fail job", || self.store.fail_job(&job.id, &message))
            .await?;

        if applied {
            warn!(
                analysis_id = %job.analysis_id,
                job_id = %job.id,
                module = %job.module,
                "Job failed: {}",
                message
            );
        }

        self.notify(&job.analysis_id).await?;
        Ok(if applied {
            JobOutcome::Failed(message)
        } else {
            JobOutcome::Duplicate
        })
    }

    async fn is_cancelled(&self, analysis_id: &str) -> Result<bool, TaskError> {
        let analysis = self
            .store_op("load analysis", || self.store.get_analysis(analysis_id))
            .await?;
        Ok(analysis.map_or(true, |a| a.status == AnalysisStatus::Cancelled))
    }

    async fn notify(&self, analysis_id: &str) -> Result<AggregationOutcome, TaskError> {
        let outcome = self
            .store_op("aggregate analysis", || {
                self.aggregator.on_job_terminal(analysis_id)
            })
            .await?;

        match &outcome {
            AggregationOutcome::Pending { remaining } => {
                debug!(analysis_id, remaining, "Waiting for other modules")
            }
            AggregationOutcome::Aggregated(analysis) => {
                debug!(analysis_id, status = %analysis.status, "Finalized analysis")
            }
            AggregationOutcome::AlreadyFinalized => {}
        }
        Ok(outcome)
    }

    async fn store_op<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.retry
            .run(operation, StoreError::is_retryable, op)
            .await
            .map_err(TaskError::from)
    }
}

fn describe(duration: Duration) -> String {
    if duration.as_millis() % 1000 == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
