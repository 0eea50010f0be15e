//! Data models for the page auditor.
//!
//! This module contains the records shared by every component: the
//! analysis and its per-module jobs, findings, and the status enums that
//! drive the lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity level of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cosmetic or best-practice deviation
    Minor,
    /// Noticeable problem with a workaround
    Moderate,
    /// Blocks some users or degrades the page badly
    Serious,
    /// Blocks most users or breaks the page
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Minor => "minor",
            Severity::Moderate => "moderate",
            Severity::Serious => "serious",
            Severity::Critical => "critical",
        }
    }

    /// Returns an emoji representation of the severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Minor => "🟢",
            Severity::Moderate => "🟡",
            Severity::Serious => "🟠",
            Severity::Critical => "🔴",
        }
    }

    /// Penalty points subtracted from a module score.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Minor => 1.0,
            Severity::Moderate => 2.0,
            Severity::Serious => 5.0,
            Severity::Critical => 10.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Minor => write!(f, "Minor"),
            Severity::Moderate => write!(f, "Moderate"),
            Severity::Serious => write!(f, "Serious"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minor" => Ok(Severity::Minor),
            "moderate" => Ok(Severity::Moderate),
            "serious" => Ok(Severity::Serious),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// The static catalog of analysis modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Accessibility,
    Structure,
    Performance,
}

impl ModuleKind {
    /// Every module in catalog order.
    pub const ALL: [ModuleKind; 3] = [
        ModuleKind::Accessibility,
        ModuleKind::Structure,
        ModuleKind::Performance,
    ];

    /// Stable identifier used in the store and queue names.
    pub fn id(&self) -> &'static str {
        match self {
            ModuleKind::Accessibility => "accessibility",
            ModuleKind::Structure => "structure",
            ModuleKind::Performance => "performance",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ModuleKind::Accessibility => "Accessibility",
            ModuleKind::Structure => "Structure",
            ModuleKind::Performance => "Performance",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ModuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "accessibility" | "a11y" => Ok(ModuleKind::Accessibility),
            "structure" => Ok(ModuleKind::Structure),
            "performance" | "perf" => Ok(ModuleKind::Performance),
            other => Err(format!("unknown analysis module '{}'", other)),
        }
    }
}

/// Lifecycle status of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Fetching,
    Analyzing,
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Fetching => "fetching",
            AnalysisStatus::Analyzing => "analyzing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::PartiallyFailed => "partially_failed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Completed
                | AnalysisStatus::PartiallyFailed
                | AnalysisStatus::Failed
                | AnalysisStatus::Cancelled
        )
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "fetching" => Ok(AnalysisStatus::Fetching),
            "analyzing" => Ok(AnalysisStatus::Analyzing),
            "completed" => Ok(AnalysisStatus::Completed),
            "partially_failed" => Ok(AnalysisStatus::PartiallyFailed),
            "failed" => Ok(AnalysisStatus::Failed),
            "cancelled" => Ok(AnalysisStatus::Cancelled),
            other => Err(format!("unknown analysis status '{}'", other)),
        }
    }
}

/// Lifecycle status of a single module job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// One end-to-end analysis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub tenant_id: String,
    /// URL of the page being analyzed.
    pub target_url: String,
    /// Asset store prefix holding the captured page.
    pub asset_path: String,
    pub status: AnalysisStatus,
    /// Aggregate score over the modules that completed.
    pub score: Option<f64>,
    pub findings_count: Option<i64>,
    /// Summary of what went wrong, for failed or partially failed analyses.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields needed to insert a new analysis.
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub id: String,
    pub tenant_id: String,
    pub target_url: String,
    pub asset_path: String,
}

/// Optional columns written together with a conditional status change.
#[derive(Debug, Clone, Default)]
pub struct AnalysisUpdate {
    pub score: Option<f64>,
    pub findings_count: Option<i64>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row per (analysis, enabled module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: String,
    pub analysis_id: String,
    pub module: ModuleKind,
    pub status: JobStatus,
    /// Module score, set when the job completes.
    pub score: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Number of times a worker moved this job to running.
    pub attempts: i64,
}

/// A finding ready to be persisted, with its catalog rule resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFinding {
    pub rule_key: String,
    pub rule_id: String,
    pub severity: Severity,
    pub location: String,
    pub message: String,
}

/// An issue recorded by an analyzer job. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub job_id: String,
    pub analysis_id: String,
    pub module: ModuleKind,
    pub rule_key: String,
    pub rule_id: String,
    pub severity: Severity,
    pub location: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Counts of findings by severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub total: usize,
    pub critical: usize,
    pub serious: usize,
    pub moderate: usize,
    pub minor: usize,
}

impl FindingSummary {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut summary = Self {
            total: findings.len(),
            ..Self::default()
        };

        for finding in findings {
            match finding.severity {
                Severity::Critical => summary.critical += 1,
                Severity::Serious => summary.serious += 1,
                Severity::Moderate => summary.moderate += 1,
                Severity::Minor => summary.minor += 1,
            }
        }

        summary
    }
}
