//! Rule catalog: maps analyzer rule keys to catalog rule ids.

use super::RawFinding;
use crate::models::{ModuleKind, NewFinding};
use std::collections::HashMap;
use tracing::warn;

const BUILTIN_RULES: &[(&str, &str)] = &[
    ("a11y.img-alt", "A11Y-001"),
    ("a11y.html-lang", "A11Y-002"),
    ("a11y.control-label", "A11Y-003"),
    ("a11y.link-name", "A11Y-004"),
    ("a11y.button-name", "A11Y-005"),
    ("structure.doctype", "STR-001"),
    ("structure.title", "STR-002"),
    ("structure.h1", "STR-003"),
    ("structure.heading-order", "STR-004"),
    ("structure.meta-description", "STR-005"),
    ("structure.viewport", "STR-006"),
    ("perf.page-weight", "PERF-001"),
    ("perf.script-count", "PERF-002"),
    ("perf.render-blocking", "PERF-003"),
    ("perf.unsized-image", "PERF-004"),
    ("perf.slow-response", "PERF-005"),
];

#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    rules: HashMap<String, String>,
}

impl RuleCatalog {
    /// Catalog covering every rule of the built-in analyzers.
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        for (key, id) in BUILTIN_RULES {
            catalog.insert(key, id);
        }
        catalog
    }

    pub fn insert(&mut self, rule_key: &str, rule_id: &str) {
        self.rules.insert(rule_key.to_string(), rule_id.to_string());
    }

    pub fn lookup(&self, rule_key: &str) -> Option<&str> {
        self.rules.get(rule_key).map(String::as_str)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Attach catalog ids. Findings whose rule is unknown are logged and
    /// dropped; this is never fatal to the job.
    pub fn resolve(&self, module: ModuleKind, raw: Vec<RawFinding>) -> Vec<NewFinding> {
        raw.into_iter()
            .filter_map(|finding| match self.lookup(&finding.rule_key) {
                Some(rule_id) => Some(NewFinding {
                    rule_id: rule_id.to_string(),
                    rule_key: finding.rule_key,
                    severity: finding.severity,
                    location: finding.location,
                    message: finding.message,
                }),
                None => {
                    warn!(
                        module = %module,
                        rule_key = %finding.rule_key,
                        "Unknown rule key, skipping finding"
                    );
                    None
                }
            })
            .collect()
    }
}
