//! Analysis modules.
//!
//! Each module turns the captured assets of a page into a list of raw
//! findings. The lifecycle around the call (job status, persistence,
//! completion tracking) lives in [`crate::lifecycle`] and is shared by
//! every module.

pub mod accessibility;
pub mod html;
pub mod performance;
pub mod rules;
pub mod structure;

use crate::assets::AssetBundle;
use crate::models::{ModuleKind, NewFinding, Severity};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub use accessibility::AccessibilityAnalyzer;
pub use performance::{PerformanceAnalyzer, PerformanceThresholds};
pub use rules::RuleCatalog;
pub use structure::StructureAnalyzer;

/// A finding as reported by an analyzer, before rule catalog lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFinding {
    pub rule_key: String,
    pub severity: Severity,
    pub location: String,
    pub message: String,
}

impl RawFinding {
    pub fn new(
        rule_key: &str,
        severity: Severity,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule_key: rule_key.to_string(),
            severity,
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Domain analysis for one module.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn module(&self) -> ModuleKind;

    async fn analyze(&self, assets: &AssetBundle) -> anyhow::Result<Vec<RawFinding>>;

    /// Module score in `0..=100` for the findings that will be stored.
    fn score(&self, findings: &[NewFinding]) -> f64 {
        severity_weighted_score(findings)
    }
}

/// `100` minus the severity weight of every finding, floored at zero.
pub fn severity_weighted_score(findings: &[NewFinding]) -> f64 {
    let penalty: f64 = findings.iter().map(|f| f.severity.weight()).sum();
    (100.0 - penalty).max(0.0)
}

/// The analyzers available to the worker runtime, keyed by module.
#[derive(Clone, Default)]
pub struct AnalyzerRegistry {
    analyzers: HashMap<ModuleKind, Arc<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in module.
    pub fn builtin(thresholds: PerformanceThresholds) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AccessibilityAnalyzer));
        registry.register(Arc::new(StructureAnalyzer));
        registry.register(Arc::new(PerformanceAnalyzer::new(thresholds)));
        registry
    }

    /// Add or replace the analyzer for its module.
    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) {
        self.analyzers.insert(analyzer.module(), analyzer);
    }

    pub fn get(&self, module: ModuleKind) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(&module).cloned()
    }

    /// Registered modules in catalog order.
    pub fn modules(&self) -> Vec<ModuleKind> {
        let mut modules: Vec<ModuleKind> = self.analyzers.keys().copied().collect();
        modules.sort();
        modules
    }
}
