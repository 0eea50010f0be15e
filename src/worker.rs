//! Worker runtime: one pool of fetch workers plus one pool per analysis
//! module, each pulling from its own queue.

use crate::aggregator::CompletionAggregator;
use crate::analyzers::{Analyzer, AnalyzerRegistry, RuleCatalog};
use crate::assets::AssetStore;
use crate::error::TaskError;
use crate::fetcher::{Capturer, FetchOutcome, Fetcher};
use crate::lifecycle::{JobLifecycle, JobOutcome};
use crate::queue::{JobQueue, QueueName, Task};
use crate::retry::RetryPolicy;
use crate::store::StatusStore;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything the workers share, wired by the caller.
#[derive(Clone)]
pub struct Components {
    pub store: Arc<dyn StatusStore>,
    pub assets: Arc<dyn AssetStore>,
    pub queue: Arc<dyn JobQueue>,
    pub capturer: Arc<dyn Capturer>,
    pub registry: AnalyzerRegistry,
    pub catalog: Arc<RuleCatalog>,
    pub aggregator: Arc<CompletionAggregator>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub fetch_concurrency: usize,
    /// Workers per analysis module.
    pub analyzer_concurrency: usize,
    pub analyzer_timeout: Duration,
    pub capture_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
    /// Delivery at which a failing task is abandoned. Matches the queue's
    /// dead-letter limit.
    pub max_deliveries: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            fetch_concurrency: 2,
            analyzer_concurrency: 2,
            analyzer_timeout: Duration::from_secs(60),
            capture_retry: RetryPolicy::default(),
            store_retry: RetryPolicy::default(),
            max_deliveries: 5,
        }
    }
}

/// What a worker does with the tasks of its queue.
#[derive(Clone)]
enum Role {
    Fetch(Arc<Fetcher>),
    Analyze {
        lifecycle: Arc<JobLifecycle>,
        analyzer: Arc<dyn Analyzer>,
    },
}

impl Role {
    fn queue(&self) -> QueueName {
        match self {
            Role::Fetch(_) => QueueName::Fetch,
            Role::Analyze { analyzer, .. } => QueueName::Module(analyzer.module()),
        }
    }

    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        match (self, task) {
            (Role::Fetch(fetcher), Task::Fetch(fetch)) => {
                match fetcher.handle(fetch).await? {
                    FetchOutcome::Dispatched { tasks } => {
                        debug!(analysis_id = %fetch.analysis_id, tasks, "Fetch done")
                    }
                    FetchOutcome::Failed(_) | FetchOutcome::Skipped => {}
                }
                Ok(())
            }
            (Role::Analyze { lifecycle, analyzer }, Task::Module(module_task))
                if module_task.module == analyzer.module() =>
            {
                if lifecycle.run(analyzer.as_ref(), module_task).await? == JobOutcome::Duplicate {
                    debug!(
                        analysis_id = %module_task.analysis_id,
                        module = %module_task.module,
                        "Duplicate delivery ignored"
                    );
                }
                Ok(())
            }
            _ => Err(TaskError::Terminal(format!(
                "task for {} delivered to {} worker",
                task.queue(),
                self.queue()
            ))),
        }
    }

    /// Record that `task` will not be processed, so its analysis can still
    /// reach a terminal status.
    async fn abandon(&self, task: &Task, reason: &str) -> Result<(), TaskError> {
        match (self, task) {
            (Role::Fetch(fetcher), Task::Fetch(fetch)) => fetcher.abandon(fetch, reason).await,
            (Role::Analyze { lifecycle, .. }, Task::Module(module_task)) => {
                lifecycle.abandon(module_task, reason).await
            }
            _ => Ok(()),
        }
    }
}

/// Running worker pools.
pub struct Runtime {
    queue: Arc<dyn JobQueue>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Spawn the fetch pool and one pool per registered module.
    pub fn start(components: &Components, settings: &WorkerSettings) -> Self {
        let fetcher = Arc::new(Fetcher::new(
            components.store.clone(),
            components.assets.clone(),
            components.queue.clone(),
            components.capturer.clone(),
            components.aggregator.clone(),
            settings.capture_retry.clone(),
            settings.store_retry.clone(),
        ));
        let lifecycle = Arc::new(JobLifecycle::new(
            components.store.clone(),
            components.assets.clone(),
            components.aggregator.clone(),
            components.catalog.clone(),
            settings.store_retry.clone(),
            settings.analyzer_timeout,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let mut pools = vec![(Role::Fetch(fetcher), settings.fetch_concurrency)];
        for module in components.registry.modules() {
            if let Some(analyzer) = components.registry.get(module) {
                pools.push((
                    Role::Analyze {
                        lifecycle: lifecycle.clone(),
                        analyzer,
                    },
                    settings.analyzer_concurrency,
                ));
            }
        }

        for (role, concurrency) in pools {
            for index in 0..concurrency.max(1) {
                let name = format!("{}#{}", role.queue(), index);
                handles.push(tokio::spawn(run_worker(
                    name,
                    components.queue.clone(),
                    role.clone(),
                    settings.max_deliveries,
                    shutdown_rx.clone(),
                )));
            }
        }

        info!("Started {} workers", handles.len());

        Self {
            queue: components.queue.clone(),
            shutdown,
            handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop receiving, let in-flight tasks finish and join every worker.
    pub async fn shutdown(self) {
        self.queue.close();
        let _ = self.shutdown.send(true);

        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!("Worker task panicked: {}", e);
            }
        }
        info!("All workers stopped");
    }
}

async fn run_worker(
    name: String,
    queue: Arc<dyn JobQueue>,
    role: Role,
    max_deliveries: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue_name = role.queue();
    debug!("Worker {} started", name);

    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            delivery = queue.receive(queue_name) => delivery,
        };
        let Some(delivery) = delivery else {
            break;
        };

        let analysis_id = delivery.task.analysis_id().to_string();
        match role.handle(&delivery.task).await {
            Ok(()) => delivery.ack(),
            Err(TaskError::Retryable(e)) if delivery.attempt < max_deliveries => {
                warn!(
                    worker = %name,
                    analysis_id = %analysis_id,
                    attempt = delivery.attempt,
                    "Task will be redelivered: {}",
                    e
                );
                delivery.nack();
            }
            Err(e) => {
                error!(
                    worker = %name,
                    analysis_id = %analysis_id,
                    attempt = delivery.attempt,
                    "Giving up on task: {}",
                    e
                );
                if let Err(abandon) = role.abandon(&delivery.task, &e.to_string()).await {
                    error!(
                        worker = %name,
                        analysis_id = %analysis_id,
                        "Could not record abandoned task: {}",
                        abandon
                    );
                }
                // A retryable failure that ran out of deliveries is
                // dead-lettered by the queue.
                match e {
                    TaskError::Retryable(_) => delivery.nack(),
                    TaskError::Terminal(_) => delivery.ack(),
                }
            }
        }
    }

    debug!("Worker {} stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ReportSignal;
    use crate::analyzers::PerformanceThresholds;
    use crate::assets::MemoryAssetStore;
    use crate::error::StoreError;
    use crate::fetcher::tests::{FailingAssets, StubCapturer};
    use crate::intake::{AnalysisRequest, Intake, Unlimited};
    use crate::lifecycle::tests::StubAnalyzer;
    use crate::models::{
        Analysis, AnalysisJob, AnalysisStatus, AnalysisUpdate, Finding, JobStatus, ModuleKind,
        NewAnalysis, NewFinding,
    };
    use crate::queue::{MemoryQueue, QueueSettings};
    use crate::store::{SqliteStatusStore, StoreResult};
    use async_trait::async_trait;

    const PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <title>Home</title>
  <meta name="description" content="Home page">
  <meta name="viewport" content="width=device-width">
</head>
<body>
  <h1>Welcome</h1>
  <img src="hero.png" alt="Hero" width="800" height="400">
</body>
</html>"#;

    const MAX_DELIVERIES: u32 = 2;

    /// SQLite store on which job completions always time out.
    struct StuckCompletions {
        inner: Arc<SqliteStatusStore>,
    }

    #[async_trait]
    impl StatusStore for StuckCompletions {
        async fn create_analysis(
            &self,
            analysis: &NewAnalysis,
            modules: &[ModuleKind],
        ) -> StoreResult<(Analysis, Vec<AnalysisJob>)> {
            self.inner.create_analysis(analysis, modules).await
        }

        async fn discard_analysis(&self, analysis_id: &str) -> StoreResult<()> {
            self.inner.discard_analysis(analysis_id).await
        }

        async fn get_analysis(&self, analysis_id: &str) -> StoreResult<Option<Analysis>> {
            self.inner.get_analysis(analysis_id).await
        }

        async fn count_active_analyses(&self, tenant_id: &str) -> StoreResult<u64> {
            self.inner.count_active_analyses(tenant_id).await
        }

        async fn update_analysis_if(
            &self,
            analysis_id: &str,
            expected: AnalysisStatus,
            new: AnalysisStatus,
            update: AnalysisUpdate,
        ) -> StoreResult<bool> {
            self.inner
                .update_analysis_if(analysis_id, expected, new, update)
                .await
        }

        async fn jobs_for_analysis(&self, analysis_id: &str) -> StoreResult<Vec<AnalysisJob>> {
            self.inner.jobs_for_analysis(analysis_id).await
        }

        async fn job_for_module(
            &self,
            analysis_id: &str,
            module: ModuleKind,
        ) -> StoreResult<Option<AnalysisJob>> {
            self.inner.job_for_module(analysis_id, module).await
        }

        async fn start_job(&self, job_id: &str) -> StoreResult<bool> {
            self.inner.start_job(job_id).await
        }

        async fn complete_job(
            &self,
            _job_id: &str,
            _findings: &[NewFinding],
            _score: f64,
        ) -> StoreResult<bool> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn fail_job(&self, job_id: &str, error: &str) -> StoreResult<bool> {
            self.inner.fail_job(job_id, error).await
        }

        async fn fail_pending_jobs(&self, analysis_id: &str, error: &str) -> StoreResult<u64> {
            self.inner.fail_pending_jobs(analysis_id, error).await
        }

        async fn findings_for_analysis(&self, analysis_id: &str) -> StoreResult<Vec<Finding>> {
            self.inner.findings_for_analysis(analysis_id).await
        }

        async fn findings_for_job(&self, job_id: &str) -> StoreResult<Vec<Finding>> {
            self.inner.findings_for_job(job_id).await
        }
    }

    struct Pipeline {
        store: Arc<SqliteStatusStore>,
        queue: Arc<MemoryQueue>,
        intake: Intake,
        runtime: Runtime,
        reports: tokio::sync::mpsc::UnboundedReceiver<Analysis>,
    }

    async fn pipeline(capturer: StubCapturer, registry: AnalyzerRegistry) -> Pipeline {
        let store = Arc::new(SqliteStatusStore::in_memory().await.unwrap());
        pipeline_with(
            capturer,
            registry,
            store.clone(),
            store,
            Arc::new(MemoryAssetStore::new()),
        )
        .await
    }

    /// Workers use `worker_store`; intake and assertions use `store`.
    async fn pipeline_with(
        capturer: StubCapturer,
        registry: AnalyzerRegistry,
        store: Arc<SqliteStatusStore>,
        worker_store: Arc<dyn StatusStore>,
        assets: Arc<dyn AssetStore>,
    ) -> Pipeline {
        let queue = Arc::new(MemoryQueue::new(QueueSettings {
            redelivery_base: Duration::ZERO,
            redelivery_max: Duration::ZERO,
            max_deliveries: MAX_DELIVERIES,
        }));
        let (signal, reports) = ReportSignal::channel();
        let aggregator = Arc::new(
            CompletionAggregator::new(worker_store.clone()).with_listener(Arc::new(signal)),
        );

        let components = Components {
            store: worker_store,
            assets,
            queue: queue.clone(),
            capturer: Arc::new(capturer),
            registry,
            catalog: Arc::new(RuleCatalog::builtin()),
            aggregator,
        };
        let settings = WorkerSettings {
            analyzer_timeout: Duration::from_millis(200),
            capture_retry: RetryPolicy::immediate(2),
            store_retry: RetryPolicy::immediate(2),
            max_deliveries: MAX_DELIVERIES,
            ..WorkerSettings::default()
        };

        let runtime = Runtime::start(&components, &settings);
        let intake = Intake::new(
            store.clone(),
            queue.clone(),
            Arc::new(Unlimited),
            RetryPolicy::immediate(2),
        );

        Pipeline {
            store,
            queue,
            intake,
            runtime,
            reports,
        }
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            target_url: "https://example.com/".to_string(),
            tenant_id: "acme".to_string(),
            modules: ModuleKind::ALL.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_clean_page() {
        let mut pipeline = pipeline(
            StubCapturer::serving(PAGE),
            AnalyzerRegistry::builtin(PerformanceThresholds::default()),
        )
        .await;
        assert_eq!(pipeline.runtime.worker_count(), 2 + 3 * 2);

        let submission = pipeline.intake.submit(request()).await.unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(5), pipeline.reports.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(finished.id, submission.analysis.id);
        assert_eq!(finished.status, AnalysisStatus::Completed);
        assert_eq!(finished.score, Some(100.0));
        assert_eq!(finished.findings_count, Some(0));

        pipeline.runtime.shutdown().await;
        assert_eq!(pipeline.queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_partial_failure() {
        let mut registry = AnalyzerRegistry::builtin(PerformanceThresholds::default());
        registry.register(Arc::new(StubAnalyzer {
            delay: Some(Duration::from_secs(10)),
            ..StubAnalyzer::clean(ModuleKind::Performance)
        }));
        let mut pipeline = pipeline(StubCapturer::serving(PAGE), registry).await;

        let mut req = request();
        req.target_url = "https://example.com/broken".to_string();
        pipeline.intake.submit(req).await.unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), pipeline.reports.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(finished.status, AnalysisStatus::PartiallyFailed);
        assert_eq!(finished.score, Some(100.0));
        assert!(finished.error.unwrap().contains("timed out"));

        pipeline.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_to_end_fetch_failure() {
        let mut pipeline = pipeline(
            StubCapturer::failing(u32::MAX, 404, ""),
            AnalyzerRegistry::builtin(PerformanceThresholds::default()),
        )
        .await;

        let submission = pipeline.intake.submit(request()).await.unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(5), pipeline.reports.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(finished.status, AnalysisStatus::Failed);
        for module in ModuleKind::ALL {
            assert_eq!(pipeline.queue.enqueued_count(QueueName::Module(module)), 0);
        }
        let jobs = pipeline
            .store
            .jobs_for_analysis(&submission.analysis.id)
            .await
            .unwrap();
        assert!(jobs.iter().all(|job| job.attempts == 0));

        pipeline.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_asset_write_failure_finishes_analysis() {
        let store = Arc::new(SqliteStatusStore::in_memory().await.unwrap());
        let mut pipeline = pipeline_with(
            StubCapturer::serving(PAGE),
            AnalyzerRegistry::builtin(PerformanceThresholds::default()),
            store.clone(),
            store,
            Arc::new(FailingAssets::default()),
        )
        .await;

        let submission = pipeline.intake.submit(request()).await.unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(5), pipeline.reports.recv())
            .await
            .expect("no completion signal")
            .unwrap();

        assert_eq!(finished.id, submission.analysis.id);
        assert_eq!(finished.status, AnalysisStatus::Failed);
        assert!(finished.error.unwrap().contains("disk full"));
        let jobs = pipeline
            .store
            .jobs_for_analysis(&submission.analysis.id)
            .await
            .unwrap();
        assert!(jobs.iter().all(|job| job.status == JobStatus::Failed));

        pipeline.runtime.shutdown().await;
        assert!(pipeline.queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_deliveries_fail_jobs() {
        let store = Arc::new(SqliteStatusStore::in_memory().await.unwrap());
        let stuck = Arc::new(StuckCompletions {
            inner: store.clone(),
        });
        let mut pipeline = pipeline_with(
            StubCapturer::serving(PAGE),
            AnalyzerRegistry::builtin(PerformanceThresholds::default()),
            store,
            stuck,
            Arc::new(MemoryAssetStore::new()),
        )
        .await;

        let submission = pipeline.intake.submit(request()).await.unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(5), pipeline.reports.recv())
            .await
            .expect("no completion signal")
            .unwrap();

        assert_eq!(finished.status, AnalysisStatus::Failed);
        let jobs = pipeline
            .store
            .jobs_for_analysis(&submission.analysis.id)
            .await
            .unwrap();
        for job in &jobs {
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.attempts, MAX_DELIVERIES as i64);
            assert!(job.error.as_deref().unwrap().contains("task abandoned"));
        }

        pipeline.runtime.shutdown().await;
        assert_eq!(pipeline.queue.dead_letters().len(), ModuleKind::ALL.len());
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let pipeline = pipeline(
            StubCapturer::serving(PAGE),
            AnalyzerRegistry::builtin(PerformanceThresholds::default()),
        )
        .await;

        tokio::time::timeout(Duration::from_secs(5), pipeline.runtime.shutdown())
            .await
            .unwrap();
    }
}
