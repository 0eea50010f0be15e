//! Report assembly and output.

pub mod generator;

use crate::error::StoreError;
use crate::models::{Analysis, Finding, FindingSummary, JobStatus, ModuleKind, Severity};
use crate::store::{StatusStore, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use generator::{generate_json_report, generate_markdown_report};

/// Outcome of one module within an analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleReport {
    pub module: ModuleKind,
    pub status: JobStatus,
    pub score: Option<f64>,
    pub error: Option<String>,
    pub attempts: i64,
    pub findings: Vec<Finding>,
}

/// Everything known about a finished analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub analysis: Analysis,
    pub modules: Vec<ModuleReport>,
    pub summary: FindingSummary,
    pub generated_at: DateTime<Utc>,
}

impl AnalysisReport {
    /// Load the analysis, its jobs and findings from the status store.
    pub async fn load(store: &dyn StatusStore, analysis_id: &str) -> StoreResult<Self> {
        let analysis = store
            .get_analysis(analysis_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "analysis",
                id: analysis_id.to_string(),
            })?;
        let jobs = store.jobs_for_analysis(analysis_id).await?;
        let findings = store.findings_for_analysis(analysis_id).await?;

        let mut modules: Vec<ModuleReport> = jobs
            .into_iter()
            .map(|job| ModuleReport {
                findings: findings
                    .iter()
                    .filter(|f| f.job_id == job.id)
                    .cloned()
                    .collect(),
                module: job.module,
                status: job.status,
                score: job.score,
                error: job.error,
                attempts: job.attempts,
            })
            .collect();
        modules.sort_by_key(|m| m.module);

        Ok(Self {
            summary: FindingSummary::from_findings(&findings),
            analysis,
            modules,
            generated_at: Utc::now(),
        })
    }

    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.modules.iter().flat_map(|m| m.findings.iter())
    }

    /// Whether any finding is at or above `threshold`.
    pub fn has_findings_at_or_above(&self, threshold: Severity) -> bool {
        self.findings().any(|f| f.severity >= threshold)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{AnalysisStatus, AnalysisUpdate, NewAnalysis, NewFinding};
    use crate::store::SqliteStatusStore;

    /// A partially failed analysis: accessibility with two findings,
    /// structure clean, performance failed.
    pub(crate) async fn stored_report() -> AnalysisReport {
        let store = SqliteStatusStore::in_memory().await.unwrap();
        let new = NewAnalysis {
            id: "a1".to_string(),
            tenant_id: "acme".to_string(),
            target_url: "https://example.com/".to_string(),
            asset_path: "acme/a1".to_string(),
        };
        let (_, jobs) = store.create_analysis(&new, &ModuleKind::ALL).await.unwrap();

        for job in &jobs {
            store.start_job(&job.id).await.unwrap();
            match job.module {
                ModuleKind::Accessibility => {
                    let findings = vec![
                        NewFinding {
                            rule_key: "a11y.control-label".to_string(),
                            rule_id: "A11Y-003".to_string(),
                            severity: Severity::Critical,
                            location: r#"img[src="hero.png"]"#.to_string(),
                            message: "Form control <input> has no associated label".to_string(),
                        },
                        NewFinding {
                            rule_key: "a11y.img-alt".to_string(),
                            rule_id: "A11Y-001".to_string(),
                            severity: Severity::Serious,
                            location: r#"input[name="email"]"#.to_string(),
                            message: "Image hero.png has no alt attribute".to_string(),
                        },
                    ];
                    store.complete_job(&job.id, &findings, 85.0).await.unwrap();
                }
                ModuleKind::Structure => {
                    store.complete_job(&job.id, &[], 100.0).await.unwrap();
                }
                ModuleKind::Performance => {
                    store
                        .fail_job(&job.id, "analysis timed out after 60s")
                        .await
                        .unwrap();
                }
            }
        }

        store
            .update_analysis_if(
                "a1",
                AnalysisStatus::Pending,
                AnalysisStatus::PartiallyFailed,
                AnalysisUpdate {
                    score: Some(92.5),
                    findings_count: Some(2),
                    error: Some("performance: analysis timed out after 60s".to_string()),
                    completed_at: Some(Utc::now()),
                },
            )
            .await
            .unwrap();

        AnalysisReport::load(&store, "a1").await.unwrap()
    }

    #[tokio::test]
    async fn test_load_groups_findings_by_module() {
        let report = stored_report().await;

        assert_eq!(report.analysis.status, AnalysisStatus::PartiallyFailed);
        assert_eq!(report.modules.len(), 3);
        assert_eq!(report.modules[0].module, ModuleKind::Accessibility);
        assert_eq!(report.modules[0].findings.len(), 2);
        assert!(report.modules[1].findings.is_empty());
        assert_eq!(report.modules[2].status, JobStatus::Failed);
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.critical, 1);
    }

    #[tokio::test]
    async fn test_fail_on_threshold() {
        let report = stored_report().await;

        assert!(report.has_findings_at_or_above(Severity::Critical));
        assert!(report.has_findings_at_or_above(Severity::Minor));

        let mut clean = report.clone();
        clean.modules.iter_mut().for_each(|m| m.findings.clear());
        assert!(!clean.has_findings_at_or_above(Severity::Minor));
    }

    #[tokio::test]
    async fn test_load_missing_analysis() {
        let store = SqliteStatusStore::in_memory().await.unwrap();
        let err = AnalysisReport::load(&store, "nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
