//! Completion aggregation.
//!
//! Every terminal job transition ends with a call to
//! [`CompletionAggregator::on_job_terminal`]. Whichever caller observes the
//! last job turning terminal races the others on a single compare-and-swap of
//! the analysis status; only the winner fires the completion listeners.

use crate::error::StoreError;
use crate::models::{Analysis, AnalysisJob, AnalysisStatus, AnalysisUpdate, JobStatus};
use crate::store::{StatusStore, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Side effect run once per analysis, after it reached a terminal status.
#[async_trait]
pub trait CompletionListener: Send + Sync {
    async fn on_complete(&self, analysis: &Analysis) -> anyhow::Result<()>;
}

/// Sends the terminal analysis to whoever is waiting for the report.
pub struct ReportSignal {
    tx: mpsc::UnboundedSender<Analysis>,
}

impl ReportSignal {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Analysis>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CompletionListener for ReportSignal {
    async fn on_complete(&self, analysis: &Analysis) -> anyhow::Result<()> {
        self.tx
            .send(analysis.clone())
            .map_err(|_| anyhow::anyhow!("report receiver dropped"))
    }
}

#[derive(Debug)]
pub enum AggregationOutcome {
    /// Some jobs are still running or pending.
    Pending { remaining: usize },
    /// This call finalized the analysis.
    Aggregated(Analysis),
    /// Another caller (or a cancellation) finalized it first.
    AlreadyFinalized,
}

/// Aggregate outcome derived from a set of terminal jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub status: AnalysisStatus,
    /// Mean score of the completed modules.
    pub score: Option<f64>,
    pub error: Option<String>,
}

impl Aggregate {
    /// Derive the outcome of terminal jobs. Scores are summed in module
    /// order so the result does not depend on the order jobs finished in.
    pub fn from_jobs(jobs: &[AnalysisJob]) -> Self {
        let mut sorted: Vec<&AnalysisJob> = jobs.iter().collect();
        sorted.sort_by_key(|job| job.module);

        let completed: Vec<f64> = sorted
            .iter()
            .filter(|job| job.status == JobStatus::Completed)
            .map(|job| job.score.unwrap_or(0.0))
            .collect();
        let failed: Vec<&&AnalysisJob> = sorted
            .iter()
            .filter(|job| job.status == JobStatus::Failed)
            .collect();

        let status = match (completed.len(), failed.len()) {
            (0, _) => AnalysisStatus::Failed,
            (_, 0) => AnalysisStatus::Completed,
            _ => AnalysisStatus::PartiallyFailed,
        };

        let score = if completed.is_empty() {
            None
        } else {
            Some(completed.iter().sum::<f64>() / completed.len() as f64)
        };

        let error = if jobs.is_empty() {
            Some("analysis has no jobs".to_string())
        } else if failed.is_empty() {
            None
        } else {
            let messages: Vec<&str> = failed
                .iter()
                .map(|job| job.error.as_deref().unwrap_or("unknown error"))
                .collect();
            // A fetch failure fails every job with the same message.
            if messages.iter().all(|m| *m == messages[0]) && failed.len() == jobs.len() {
                Some(messages[0].to_string())
            } else {
                Some(
                    failed
                        .iter()
                        .zip(&messages)
                        .map(|(job, message)| format!("{}: {}", job.module, message))
                        .collect::<Vec<_>>()
                        .join("; "),
                )
            }
        };

        Self {
            status,
            score,
            error,
        }
    }
}

pub struct CompletionAggregator {
    store: Arc<dyn StatusStore>,
    listeners: Vec<Arc<dyn CompletionListener>>,
}

impl CompletionAggregator {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self {
            store,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn CompletionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Called after any job of an analysis became terminal.
    pub async fn on_job_terminal(&self, analysis_id: &str) -> StoreResult<AggregationOutcome> {
        self.try_complete(analysis_id, AnalysisStatus::Analyzing).await
    }

    /// Finalize the analysis if all of its jobs are terminal and it is still
    /// in `expected`.
    pub async fn try_complete(
        &self,
        analysis_id: &str,
        expected: AnalysisStatus,
    ) -> StoreResult<AggregationOutcome> {
        let jobs = self.store.jobs_for_analysis(analysis_id).await?;
        let remaining = jobs.iter().filter(|job| !job.status.is_terminal()).count();
        if remaining > 0 {
            debug!(analysis_id, remaining, "Analysis still has open jobs");
            return Ok(AggregationOutcome::Pending { remaining });
        }

        let aggregate = Aggregate::from_jobs(&jobs);
        let findings_count = self.store.findings_for_analysis(analysis_id).await?.len() as i64;

        let applied = self
            .store
            .update_analysis_if(
                analysis_id,
                expected,
                aggregate.status,
                AnalysisUpdate {
                    score: aggregate.score,
                    findings_count: Some(findings_count),
                    error: aggregate.error.clone(),
                    completed_at: Some(Utc::now()),
                },
            )
            .await?;

        if !applied {
            debug!(analysis_id, "Analysis already finalized by another worker");
            return Ok(AggregationOutcome::AlreadyFinalized);
        }

        let analysis = self
            .store
            .get_analysis(analysis_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "analysis",
                id: analysis_id.to_string(),
            })?;

        info!(
            analysis_id,
            status = %analysis.status,
            score = ?analysis.score,
            findings = findings_count,
            "Analysis finished"
        );

        for listener in &self.listeners {
            if let Err(e) = listener.on_complete(&analysis).await {
                warn!(analysis_id, "Completion listener failed: {}", e);
            }
        }

        Ok(AggregationOutcome::Aggregated(analysis))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ModuleKind, NewAnalysis, NewFinding, Severity};
    use crate::store::SqliteStatusStore;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts how many times the completion side effect ran.
    #[derive(Default)]
    pub(crate) struct CountingListener {
        pub(crate) calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionListener for CountingListener {
        async fn on_complete(&self, _analysis: &Analysis) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingListener;

    #[async_trait]
    impl CompletionListener for FailingListener {
        async fn on_complete(&self, _analysis: &Analysis) -> anyhow::Result<()> {
            anyhow::bail!("webhook unavailable")
        }
    }

    fn job(module: ModuleKind, status: JobStatus, score: Option<f64>) -> AnalysisJob {
        AnalysisJob {
            id: format!("job-{}", module),
            analysis_id: "a1".to_string(),
            module,
            status,
            score,
            started_at: None,
            completed_at: None,
            error: (status == JobStatus::Failed).then(|| format!("{} broke", module)),
            attempts: 1,
        }
    }

    async fn analyzing(store: &SqliteStatusStore, id: &str) -> Vec<AnalysisJob> {
        let new = NewAnalysis {
            id: id.to_string(),
            tenant_id: "acme".to_string(),
            target_url: "https://example.com/".to_string(),
            asset_path: format!("acme/{}", id),
        };
        let (_, jobs) = store.create_analysis(&new, &ModuleKind::ALL).await.unwrap();
        for (from, to) in [
            (AnalysisStatus::Pending, AnalysisStatus::Fetching),
            (AnalysisStatus::Fetching, AnalysisStatus::Analyzing),
        ] {
            assert!(store
                .update_analysis_if(id, from, to, AnalysisUpdate::default())
                .await
                .unwrap());
        }
        jobs
    }

    /// Drive one job to a terminal state and report it.
    async fn finish(
        store: &SqliteStatusStore,
        aggregator: &CompletionAggregator,
        job: &AnalysisJob,
        succeed: bool,
    ) -> AggregationOutcome {
        assert!(store.start_job(&job.id).await.unwrap());
        if succeed {
            let finding = NewFinding {
                rule_key: "structure.title".to_string(),
                rule_id: "STR-002".to_string(),
                severity: Severity::Serious,
                location: "document".to_string(),
                message: "Document has no <title>".to_string(),
            };
            assert!(store.complete_job(&job.id, &[finding], 95.0).await.unwrap());
        } else {
            assert!(store.fail_job(&job.id, "boom").await.unwrap());
        }
        aggregator.on_job_terminal(&job.analysis_id).await.unwrap()
    }

    #[test]
    fn test_aggregate_outcomes() {
        let all_done = Aggregate::from_jobs(&[
            job(ModuleKind::Accessibility, JobStatus::Completed, Some(80.0)),
            job(ModuleKind::Structure, JobStatus::Completed, Some(100.0)),
        ]);
        assert_eq!(all_done.status, AnalysisStatus::Completed);
        assert_eq!(all_done.score, Some(90.0));
        assert_eq!(all_done.error, None);

        let partial = Aggregate::from_jobs(&[
            job(ModuleKind::Accessibility, JobStatus::Completed, Some(84.0)),
            job(ModuleKind::Performance, JobStatus::Failed, None),
        ]);
        assert_eq!(partial.status, AnalysisStatus::PartiallyFailed);
        assert_eq!(partial.score, Some(84.0));
        assert_eq!(partial.error.as_deref(), Some("performance: performance broke"));

        let failed = Aggregate::from_jobs(&[
            job(ModuleKind::Accessibility, JobStatus::Failed, None),
            job(ModuleKind::Structure, JobStatus::Failed, None),
        ]);
        assert_eq!(failed.status, AnalysisStatus::Failed);
        assert_eq!(failed.score, None);
    }

    #[test]
    fn test_shared_failure_message_is_reported_once() {
        let mut jobs = vec![
            job(ModuleKind::Accessibility, JobStatus::Failed, None),
            job(ModuleKind::Structure, JobStatus::Failed, None),
        ];
        for job in &mut jobs {
            job.error = Some("capture failed: HTTP 404".to_string());
        }
        assert_eq!(
            Aggregate::from_jobs(&jobs).error.as_deref(),
            Some("capture failed: HTTP 404")
        );
    }

    proptest! {
        #[test]
        fn prop_score_is_independent_of_job_order(
            (scores, order) in prop::collection::vec(0.0f64..=100.0, 3)
                .prop_flat_map(|scores| (Just(scores), Just(vec![0usize, 1, 2]).prop_shuffle()))
        ) {
            let jobs: Vec<AnalysisJob> = ModuleKind::ALL
                .iter()
                .zip(&scores)
                .map(|(module, score)| job(*module, JobStatus::Completed, Some(*score)))
                .collect();
            let shuffled: Vec<AnalysisJob> = order.iter().map(|i| jobs[*i].clone()).collect();

            let expected = Aggregate::from_jobs(&jobs);
            let actual = Aggregate::from_jobs(&shuffled);
            prop_assert_eq!(actual.status, AnalysisStatus::Completed);
            prop_assert_eq!(actual.score.map(f64::to_bits), expected.score.map(f64::to_bits));
        }
    }

    #[tokio::test]
    async fn test_every_ordering_completes_exactly_once() {
        let orderings = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for (n, ordering) in orderings.iter().enumerate() {
            let store = Arc::new(SqliteStatusStore::in_memory().await.unwrap());
            let counter = Arc::new(CountingListener::default());
            let aggregator =
                CompletionAggregator::new(store.clone()).with_listener(counter.clone());

            let id = format!("order-{}", n);
            let jobs = analyzing(&store, &id).await;

            let mut outcomes = Vec::new();
            for (step, index) in ordering.iter().enumerate() {
                // The middle job fails in every ordering.
                let outcome = finish(&store, &aggregator, &jobs[*index], step != 1).await;
                outcomes.push(outcome);
            }

            assert!(matches!(outcomes[0], AggregationOutcome::Pending { remaining: 2 }));
            assert!(matches!(outcomes[1], AggregationOutcome::Pending { remaining: 1 }));
            assert!(matches!(outcomes[2], AggregationOutcome::Aggregated(_)));
            assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

            // A late duplicate notification changes nothing.
            let again = aggregator.on_job_terminal(&id).await.unwrap();
            assert!(matches!(again, AggregationOutcome::AlreadyFinalized));
            assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

            let analysis = store.get_analysis(&id).await.unwrap().unwrap();
            assert_eq!(analysis.status, AnalysisStatus::PartiallyFailed);
            assert_eq!(analysis.score, Some(95.0));
            assert_eq!(analysis.findings_count, Some(2));
            assert!(analysis.completed_at.is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simultaneous_finishers_complete_once() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("status.db").display());
        let store = Arc::new(
            SqliteStatusStore::connect(&url, 8, Duration::from_secs(5))
                .await
                .unwrap(),
        );
        let counter = Arc::new(CountingListener::default());
        let aggregator = Arc::new(
            CompletionAggregator::new(store.clone()).with_listener(counter.clone()),
        );

        let jobs = analyzing(&store, "race").await;
        for job in &jobs {
            assert!(store.start_job(&job.id).await.unwrap());
            assert!(store.complete_job(&job.id, &[], 100.0).await.unwrap());
        }

        // Every worker observes the final job state and reports at once.
        let finishers = 8;
        let barrier = Arc::new(tokio::sync::Barrier::new(finishers));
        let handles: Vec<_> = (0..finishers)
            .map(|_| {
                let aggregator = aggregator.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    aggregator.on_job_terminal("race").await.unwrap()
                })
            })
            .collect();

        let outcomes = futures::future::join_all(handles).await;
        let winners = outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap())
            .filter(|outcome| matches!(outcome, AggregationOutcome::Aggregated(_)))
            .count();

        assert_eq!(winners, 1);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        let analysis = store.get_analysis("race").await.unwrap().unwrap();
        assert_eq!(analysis.status, AnalysisStatus::Completed);
        assert_eq!(analysis.score, Some(100.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_job_writes_complete_once() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("status.db").display());
        let store = Arc::new(
            SqliteStatusStore::connect(&url, 8, Duration::from_secs(5))
                .await
                .unwrap(),
        );
        let counter = Arc::new(CountingListener::default());
        let aggregator = Arc::new(
            CompletionAggregator::new(store.clone()).with_listener(counter.clone()),
        );

        for round in 1..=20 {
            let id = format!("race-{}", round);
            let jobs = analyzing(&store, &id).await;

            // One worker per module: each writes its own job, then reports,
            // all released at the same instant.
            let barrier = Arc::new(tokio::sync::Barrier::new(jobs.len()));
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|job| {
                    let store = store.clone();
                    let aggregator = aggregator.clone();
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        let succeed = job.module != ModuleKind::Performance;
                        finish(&store, &aggregator, &job, succeed).await
                    })
                })
                .collect();

            let winners = futures::future::join_all(handles)
                .await
                .into_iter()
                .map(|outcome| outcome.unwrap())
                .filter(|outcome| matches!(outcome, AggregationOutcome::Aggregated(_)))
                .count();

            assert_eq!(winners, 1, "round {}", round);
            assert_eq!(counter.calls.load(Ordering::SeqCst), round);
            let analysis = store.get_analysis(&id).await.unwrap().unwrap();
            assert_eq!(analysis.status, AnalysisStatus::PartiallyFailed);
            assert_eq!(analysis.findings_count, Some(2));
        }
    }

    #[tokio::test]
    async fn test_listener_failure_keeps_transition() {
        let store = Arc::new(SqliteStatusStore::in_memory().await.unwrap());
        let (signal, mut rx) = ReportSignal::channel();
        let aggregator = CompletionAggregator::new(store.clone())
            .with_listener(Arc::new(FailingListener))
            .with_listener(Arc::new(signal));

        let jobs = analyzing(&store, "a1").await;
        for job in &jobs {
            finish(&store, &aggregator, job, true).await;
        }

        let signalled = rx.recv().await.unwrap();
        assert_eq!(signalled.id, "a1");
        assert_eq!(signalled.status, AnalysisStatus::Completed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_analysis_is_not_finalized() {
        let store = Arc::new(SqliteStatusStore::in_memory().await.unwrap());
        let counter = Arc::new(CountingListener::default());
        let aggregator = CompletionAggregator::new(store.clone()).with_listener(counter.clone());

        let jobs = analyzing(&store, "a1").await;
        assert!(store
            .update_analysis_if(
                "a1",
                AnalysisStatus::Analyzing,
                AnalysisStatus::Cancelled,
                AnalysisUpdate::default()
            )
            .await
            .unwrap());

        let mut last = None;
        for job in &jobs {
            last = Some(finish(&store, &aggregator, job, false).await);
        }

        assert!(matches!(last, Some(AggregationOutcome::AlreadyFinalized)));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
        let analysis = store.get_analysis("a1").await.unwrap().unwrap();
        assert_eq!(analysis.status, AnalysisStatus::Cancelled);
    }
}
