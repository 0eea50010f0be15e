//! Performance checks derived from the capture: document weight, response
//! time and resource loading patterns.

use super::html::{attr, has_attr, Page};
use super::{Analyzer, RawFinding};
use crate::assets::AssetBundle;
use crate::models::{ModuleKind, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Limits above which the performance module reports a finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    /// Maximum size of the HTML document in bytes.
    pub max_page_bytes: usize,
    /// Maximum number of external scripts.
    pub max_scripts: usize,
    /// Response time in milliseconds above which the page counts as slow.
    pub slow_response_ms: u64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_page_bytes: 512 * 1024,
            max_scripts: 20,
            slow_response_ms: 3000,
        }
    }
}

pub struct PerformanceAnalyzer {
    thresholds: PerformanceThresholds,
}

impl PerformanceAnalyzer {
    pub fn new(thresholds: PerformanceThresholds) -> Self {
        Self { thresholds }
    }

    fn check_capture(&self, assets: &AssetBundle, findings: &mut Vec<RawFinding>) {
        let bytes = assets.html_bytes();
        if bytes > self.thresholds.max_page_bytes {
            findings.push(RawFinding::new(
                "perf.page-weight",
                Severity::Serious,
                "document",
                format!(
                    "HTML document is {} KB (limit {} KB)",
                    bytes / 1024,
                    self.thresholds.max_page_bytes / 1024
                ),
            ));
        }

        if assets.elapsed_ms > self.thresholds.slow_response_ms {
            findings.push(RawFinding::new(
                "perf.slow-response",
                Severity::Serious,
                assets.final_url.clone(),
                format!(
                    "Page took {} ms to load (limit {} ms)",
                    assets.elapsed_ms, self.thresholds.slow_response_ms
                ),
            ));
        }
    }

    fn check_scripts(&self, page: &Page, findings: &mut Vec<RawFinding>) -> anyhow::Result<()> {
        let external = page.select("script[src]")?.len();
        if external > self.thresholds.max_scripts {
            findings.push(RawFinding::new(
                "perf.script-count",
                Severity::Moderate,
                "document",
                format!(
                    "Page loads {} external scripts (limit {})",
                    external, self.thresholds.max_scripts
                ),
            ));
        }

        for script in page.select("head script[src]")? {
            let src = attr(script, "src").unwrap_or_default();
            let is_module = attr(script, "type").is_some_and(|t| t.eq_ignore_ascii_case("module"));
            if !has_attr(script, "async") && !has_attr(script, "defer") && !is_module {
                findings.push(RawFinding::new(
                    "perf.render-blocking",
                    Severity::Moderate,
                    src,
                    format!("Script {} blocks rendering; use async or defer", src),
                ));
            }
        }
        Ok(())
    }

    fn check_images(&self, page: &Page, findings: &mut Vec<RawFinding>) -> anyhow::Result<()> {
        for img in page.select("img")? {
            if !has_attr(img, "width") || !has_attr(img, "height") {
                let src = attr(img, "src").unwrap_or("(inline)");
                findings.push(RawFinding::new(
                    "perf.unsized-image",
                    Severity::Minor,
                    page.locate(img)?,
                    format!("Image {} has no explicit width and height", src),
                ));
            }
        }
        Ok(())
    }

    fn inspect(&self, assets: &AssetBundle) -> anyhow::Result<Vec<RawFinding>> {
        let page = Page::parse(&assets.html);
        let mut findings = Vec::new();

        self.check_capture(assets, &mut findings);
        self.check_scripts(&page, &mut findings)?;
        self.check_images(&page, &mut findings)?;

        Ok(findings)
    }
}

#[async_trait]
impl Analyzer for PerformanceAnalyzer {
    fn module(&self) -> ModuleKind {
        ModuleKind::Performance
    }

    async fn analyze(&self, assets: &AssetBundle) -> anyhow::Result<Vec<RawFinding>> {
        self.inspect(assets)
    }
}
