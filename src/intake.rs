//! Intake: validates analysis requests, enforces quota and creates the
//! analysis with its jobs before handing it to the fetch queue.

use crate::error::{IntakeError, StoreError};
use crate::models::{Analysis, AnalysisJob, AnalysisStatus, AnalysisUpdate, ModuleKind, NewAnalysis};
use crate::queue::{FetchTask, JobQueue, Task};
use crate::retry::RetryPolicy;
use crate::store::StatusStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

const MAX_TENANT_ID_LEN: usize = 64;

/// A request to analyze one page.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub target_url: String,
    pub tenant_id: String,
    pub modules: Vec<ModuleKind>,
}

/// Decides whether a tenant may start another analysis.
#[async_trait]
pub trait QuotaPolicy: Send + Sync {
    async fn check(&self, tenant_id: &str) -> Result<(), IntakeError>;
}

/// No limit.
pub struct Unlimited;

#[async_trait]
impl QuotaPolicy for Unlimited {
    async fn check(&self, _tenant_id: &str) -> Result<(), IntakeError> {
        Ok(())
    }
}

/// Caps the number of non-terminal analyses per tenant.
pub struct ActiveAnalysisQuota {
    store: Arc<dyn StatusStore>,
    limit: u64,
}

impl ActiveAnalysisQuota {
    pub fn new(store: Arc<dyn StatusStore>, limit: u64) -> Self {
        Self { store, limit }
    }
}

#[async_trait]
impl QuotaPolicy for ActiveAnalysisQuota {
    async fn check(&self, tenant_id: &str) -> Result<(), IntakeError> {
        let active = self.store.count_active_analyses(tenant_id).await?;
        if active >= self.limit {
            return Err(IntakeError::QuotaExceeded {
                tenant_id: tenant_id.to_string(),
                active,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

/// Created analysis returned to the caller.
#[derive(Debug, Clone)]
pub struct Submission {
    pub analysis: Analysis,
    pub jobs: Vec<AnalysisJob>,
}

pub struct Intake {
    store: Arc<dyn StatusStore>,
    queue: Arc<dyn JobQueue>,
    quota: Arc<dyn QuotaPolicy>,
    retry: RetryPolicy,
}

impl Intake {
    pub fn new(
        store: Arc<dyn StatusStore>,
        queue: Arc<dyn JobQueue>,
        quota: Arc<dyn QuotaPolicy>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            quota,
            retry,
        }
    }

    /// Validate, create the analysis and its jobs, then enqueue exactly one
    /// fetch task.
    pub async fn submit(&self, request: AnalysisRequest) -> Result<Submission, IntakeError> {
        let target_url = validate_url(&request.target_url)?;
        validate_tenant(&request.tenant_id)?;
        validate_modules(&request.modules)?;

        self.quota.check(&request.tenant_id).await?;

        let id = Uuid::new_v4().to_string();
        let new = NewAnalysis {
            asset_path: format!("{}/{}", request.tenant_id, id),
            id,
            tenant_id: request.tenant_id.clone(),
            target_url,
        };

        let (analysis, jobs) = self
            .retry
            .run("create analysis", StoreError::is_retryable, || {
                self.store.create_analysis(&new, &request.modules)
            })
            .await?;

        let task = Task::Fetch(FetchTask {
            analysis_id: analysis.id.clone(),
            asset_path: analysis.asset_path.clone(),
        });

        // A closed queue stays closed, so enqueue failures are not retried.
        if let Err(e) = self.queue.enqueue(task).await {
            warn!(analysis_id = %analysis.id, "Could not enqueue fetch task: {}", e);
            // Without a fetch task nothing would ever finish this analysis.
            if let Err(discard) = self.store.discard_analysis(&analysis.id).await {
                error!(
                    analysis_id = %analysis.id,
                    "Failed to discard unqueued analysis: {}", discard
                );
            }
            return Err(e.into());
        }

        info!(
            analysis_id = %analysis.id,
            tenant_id = %analysis.tenant_id,
            url = %analysis.target_url,
            modules = jobs.len(),
            "Analysis submitted"
        );

        Ok(Submission { analysis, jobs })
    }

    /// Cancel a non-terminal analysis. Returns `false` if it had already
    /// finished. Jobs that are running fail themselves at their next
    /// cancellation check.
    pub async fn cancel(&self, analysis_id: &str) -> Result<bool, IntakeError> {
        for _ in 0..3 {
            let analysis = self
                .store
                .get_analysis(analysis_id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "analysis",
                    id: analysis_id.to_string(),
                })?;

            if analysis.status.is_terminal() {
                return Ok(false);
            }

            let applied = self
                .store
                .update_analysis_if(
                    analysis_id,
                    analysis.status,
                    AnalysisStatus::Cancelled,
                    AnalysisUpdate {
                        error: Some("analysis cancelled".to_string()),
                        completed_at: Some(Utc::now()),
                        ..AnalysisUpdate::default()
                    },
                )
                .await?;

            if applied {
                let failed = self
                    .store
                    .fail_pending_jobs(analysis_id, "analysis cancelled")
                    .await?;
                info!(analysis_id, failed, "Analysis cancelled");
                return Ok(true);
            }
            // Status moved underneath us; look again.
        }

        Ok(false)
    }
}

fn validate_url(raw: &str) -> Result<String, IntakeError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| IntakeError::Validation(format!("target URL '{}': {}", raw, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(IntakeError::Validation(format!(
            "target URL must use http or https, got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(IntakeError::Validation(format!(
            "target URL '{}' has no host",
            raw
        )));
    }

    Ok(url.to_string())
}

fn validate_tenant(tenant_id: &str) -> Result<(), IntakeError> {
    if tenant_id.is_empty() {
        return Err(IntakeError::Validation("tenant id is required".to_string()));
    }
    if tenant_id.len() > MAX_TENANT_ID_LEN {
        return Err(IntakeError::Validation(format!(
            "tenant id is longer than {} characters",
            MAX_TENANT_ID_LEN
        )));
    }
    if !tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(IntakeError::Validation(format!(
            "tenant id '{}' may only contain letters, digits, '-' and '_'",
            tenant_id
        )));
    }
    Ok(())
}

fn validate_modules(modules: &[ModuleKind]) -> Result<(), IntakeError> {
    if modules.is_empty() {
        return Err(IntakeError::Validation(
            "at least one analysis module is required".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for module in modules {
        if !seen.insert(module) {
            return Err(IntakeError::Validation(format!(
                "module '{}' requested more than once",
                module
            )));
        }
    }
    Ok(())
}
