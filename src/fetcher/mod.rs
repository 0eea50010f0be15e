//! Fetch worker: captures the target page once and fans out one task per
//! module job.

pub mod capture;

use crate::aggregator::CompletionAggregator;
use crate::assets::{save_bundle, AssetStore};
use crate::error::{AssetError, CaptureError, StoreError, TaskError};
use crate::models::{Analysis, AnalysisStatus, AnalysisUpdate};
use crate::queue::{FetchTask, JobQueue, ModuleTask, Task};
use crate::retry::RetryPolicy;
use crate::store::{StatusStore, StoreResult};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use capture::{Capturer, HttpCapturer};

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Assets captured (now or earlier) and module tasks enqueued.
    Dispatched { tasks: usize },
    /// Capture failed; every job was failed and the analysis finalized.
    Failed(String),
    /// Nothing to do: the analysis is terminal or another worker owns it.
    Skipped,
}

pub struct Fetcher {
    store: Arc<dyn StatusStore>,
    assets: Arc<dyn AssetStore>,
    queue: Arc<dyn JobQueue>,
    capturer: Arc<dyn Capturer>,
    aggregator: Arc<CompletionAggregator>,
    capture_retry: RetryPolicy,
    store_retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(
        store: Arc<dyn StatusStore>,
        assets: Arc<dyn AssetStore>,
        queue: Arc<dyn JobQueue>,
        capturer: Arc<dyn Capturer>,
        aggregator: Arc<CompletionAggregator>,
        capture_retry: RetryPolicy,
        store_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            assets,
            queue,
            capturer,
            aggregator,
            capture_retry,
            store_retry,
        }
    }

    pub async fn handle(&self, task: &FetchTask) -> Result<FetchOutcome, TaskError> {
        let analysis = self.load_analysis(&task.analysis_id).await?;

        match self.advance(&analysis, task).await {
            // Anything that will not be retried leaves no one to finish the
            // analysis, so it fails here.
            Err(TaskError::Terminal(message)) => self.fail_open(&analysis.id, message).await,
            result => result,
        }
    }

    async fn advance(
        &self,
        analysis: &Analysis,
        task: &FetchTask,
    ) -> Result<FetchOutcome, TaskError> {
        match analysis.status {
            AnalysisStatus::Pending => {
                if !self
                    .transition(&analysis.id, AnalysisStatus::Pending, AnalysisStatus::Fetching)
                    .await?
                {
                    // Lost to a concurrent delivery or a cancellation.
                    return Ok(FetchOutcome::Skipped);
                }
            }
            // Redelivered after a crash mid-capture.
            AnalysisStatus::Fetching => {
                debug!(analysis_id = %analysis.id, "Resuming interrupted fetch");
            }
            // Crashed after the fan-out started: finish it.
            AnalysisStatus::Analyzing => {
                let tasks = self.dispatch(analysis, task).await?;
                return Ok(FetchOutcome::Dispatched { tasks });
            }
            status => {
                debug!(analysis_id = %analysis.id, %status, "Analysis already terminal");
                return Ok(FetchOutcome::Skipped);
            }
        }

        self.capture_and_dispatch(analysis, task).await
    }

    async fn capture_and_dispatch(
        &self,
        analysis: &Analysis,
        task: &FetchTask,
    ) -> Result<FetchOutcome, TaskError> {
        info!(analysis_id = %analysis.id, url = %analysis.target_url, "Fetching page");

        let capture = self
            .capture_retry
            .run("capture page", CaptureError::is_retryable, || {
                self.capturer.capture(&analysis.target_url)
            })
            .await;

        let bundle = match capture {
            Ok(bundle) => bundle,
            Err(e) => {
                let message = format!("capture failed: {}", e);
                return self.fail(analysis, message, AnalysisStatus::Fetching).await;
            }
        };

        let saved = self
            .store_retry
            .run("save assets", AssetError::is_retryable, || {
                save_bundle(self.assets.as_ref(), &task.asset_path, &bundle)
            })
            .await;
        if let Err(e) = saved {
            let message = format!("could not store captured assets: {}", e);
            return self.fail(analysis, message, AnalysisStatus::Fetching).await;
        }

        if !self
            .transition(&analysis.id, AnalysisStatus::Fetching, AnalysisStatus::Analyzing)
            .await?
        {
            debug!(analysis_id = %analysis.id, "Analysis left fetching during capture");
            return Ok(FetchOutcome::Skipped);
        }

        let tasks = self.dispatch(analysis, task).await?;
        info!(
            analysis_id = %analysis.id,
            bytes = bundle.html_bytes(),
            resources = bundle.resources.len(),
            tasks,
            "Page captured, analysis dispatched"
        );
        Ok(FetchOutcome::Dispatched { tasks })
    }

    /// Give up on a fetch task that will not be delivered again. Jobs that
    /// never started are failed with `reason` and the analysis is finalized
    /// from whatever status it was left in.
    pub async fn abandon(&self, task: &FetchTask, reason: &str) -> Result<(), TaskError> {
        self.fail_open(&task.analysis_id, format!("fetch abandoned: {}", reason))
            .await?;
        Ok(())
    }

    /// Enqueue one module task per job that is not terminal yet.
    async fn dispatch(&self, analysis: &Analysis, task: &FetchTask) -> Result<usize, TaskError> {
        let jobs = self
            .store_op("load jobs", || self.store.jobs_for_analysis(&analysis.id))
            .await?;

        let mut dispatched = 0;
        for job in jobs.iter().filter(|job| !job.status.is_terminal()) {
            self.queue
                .enqueue(Task::Module(ModuleTask {
                    analysis_id: analysis.id.clone(),
                    asset_path: task.asset_path.clone(),
                    module: job.module,
                }))
                .await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn fail(
        &self,
        analysis: &Analysis,
        message: String,
        expected: AnalysisStatus,
    ) -> Result<FetchOutcome, TaskError> {
        warn!(analysis_id = %analysis.id, "{}", message);

        let failed = self
            .store_op("fail pending jobs", || {
                self.store.fail_pending_jobs(&analysis.id, &message)
            })
            .await?;
        debug!(analysis_id = %analysis.id, failed, "Failed pending jobs");

        self.store_op("finalize analysis", || {
            self.aggregator.try_complete(&analysis.id, expected)
        })
        .await?;

        Ok(FetchOutcome::Failed(message))
    }

    /// [`Self::fail`] from the analysis' current status, unless it is
    /// already terminal or gone.
    async fn fail_open(&self, analysis_id: &str, message: String) -> Result<FetchOutcome, TaskError> {
        let analysis = self
            .store_op("load analysis", || self.store.get_analysis(analysis_id))
            .await?;
        match analysis {
            Some(analysis) if !analysis.status.is_terminal() => {
                let status = analysis.status;
                self.fail(&analysis, message, status).await
            }
            _ => {
                warn!(analysis_id, "Dropping fetch task: {}", message);
                Ok(FetchOutcome::Skipped)
            }
        }
    }

    async fn load_analysis(&self, analysis_id: &str) -> Result<Analysis, TaskError> {
        self.store_op("load analysis", || self.store.get_analysis(analysis_id))
            .await?
            .ok_or_else(|| TaskError::Terminal(format!("unknown analysis {}", analysis_id)))
    }

    async fn transition(
        &self,
        analysis_id: &str,
        from: AnalysisStatus,
        to: AnalysisStatus,
    ) -> Result<bool, TaskError> {
        self.store_op("update analysis status", || {
            self.store
                .update_analysis_if(analysis_id, from, to, AnalysisUpdate::default())
        })
        .await
    }

    async fn store_op<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.store_retry
            .run(operation, StoreError::is_retryable, op)
            .await
            .map_err(TaskError::from)
    }
}
