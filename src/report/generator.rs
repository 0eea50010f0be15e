//! Markdown and JSON report generation.
//!
//! This module renders an [`AnalysisReport`] for humans (Markdown) or
//! machines (JSON).

use super::{AnalysisReport, ModuleReport};
use crate::models::{Analysis, Finding, FindingSummary, JobStatus, Severity};
use anyhow::Result;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &AnalysisReport) -> String {
    let mut output = String::new();

    // Title
    output.push_str("# PageAudit Report\n\n");

    output.push_str(&generate_metadata_section(&report.analysis));
    output.push_str(&generate_summary_section(&report.summary, &report.modules));
    output.push_str(&generate_findings_section(&report.modules));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(analysis: &Analysis) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Page:** {}\n", analysis.target_url));
    section.push_str(&format!("- **Analysis:** `{}`\n", analysis.id));
    section.push_str(&format!("- **Tenant:** {}\n", analysis.tenant_id));
    section.push_str(&format!("- **Status:** {}\n", analysis.status));
    if let Some(score) = analysis.score {
        section.push_str(&format!("- **Score:** {:.1} / 100\n", score));
    }
    section.push_str(&format!(
        "- **Submitted:** {}\n",
        analysis.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(completed_at) = analysis.completed_at {
        let duration = completed_at - analysis.created_at;
        section.push_str(&format!(
            "- **Duration:** {:.1}s\n",
            duration.num_milliseconds() as f64 / 1000.0
        ));
    }
    if let Some(ref error) = analysis.error {
        section.push_str(&format!("- **Error:** {}\n", error));
    }
    section.push('\n');

    section
}

/// Generate the summary section.
fn generate_summary_section(summary: &FindingSummary, modules: &[ModuleReport]) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");

    section.push_str("### Modules\n\n");
    section.push_str("| Module | Status | Score | Findings |\n");
    section.push_str("|:---|:---:|:---:|:---:|\n");
    for module in modules {
        let status = match module.status {
            JobStatus::Completed => "✅ completed".to_string(),
            JobStatus::Failed => "❌ failed".to_string(),
            other => other.to_string(),
        };
        let score = module
            .score
            .map(|s| format!("{:.1}", s))
            .unwrap_or_else(|| "-".to_string());
        section.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            module.module.display_name(),
            status,
            score,
            module.findings.len()
        ));
    }
    section.push('\n');

    section.push_str("### Finding Severity Breakdown\n\n");
    section.push_str(&format!(
        "| {} Critical | {} Serious | {} Moderate | {} Minor | **Total** |\n",
        Severity::Critical.emoji(),
        Severity::Serious.emoji(),
        Severity::Moderate.emoji(),
        Severity::Minor.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | **{}** |\n\n",
        summary.critical, summary.serious, summary.moderate, summary.minor, summary.total
    ));

    section
}

/// Generate the findings section, one subsection per module.
fn generate_findings_section(modules: &[ModuleReport]) -> String {
    let mut section = String::new();

    section.push_str("## Findings by Module\n\n");

    for module in modules {
        section.push_str(&format!("### {}\n\n", module.module.display_name()));

        if let Some(ref error) = module.error {
            section.push_str(&format!("> ⚠️ Module failed: {}\n\n", error));
            continue;
        }

        if module.findings.is_empty() {
            section.push_str("No findings. 🎉\n\n");
            continue;
        }

        // Most severe first, then by location
        let mut findings = module.findings.clone();
        findings.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.location.cmp(&b.location))
        });

        for finding in &findings {
            section.push_str(&generate_finding_block(finding));
        }
    }

    section
}

/// Generate a single finding block.
fn generate_finding_block(finding: &Finding) -> String {
    format!(
        "- {} **{}** `{}` ({}): {}\n",
        finding.severity.emoji(),
        finding.severity.as_str().to_uppercase(),
        finding.rule_id,
        finding.location,
        finding.message
    )
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("\n---\n\n");
    footer.push_str(&format!(
        "*Report generated by pageaudit v{}*\n",
        env!("CARGO_PKG_VERSION")
    ));

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &AnalysisReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::stored_report;

    #[tokio::test]
    async fn test_generate_markdown_report() {
        let report = stored_report().await;
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# PageAudit Report"));
        assert!(markdown.contains("## Metadata"));
        assert!(markdown.contains("- **Status:** partially_failed"));
        assert!(markdown.contains("- **Score:** 92.5 / 100"));
        assert!(markdown.contains("| Accessibility | ✅ completed | 85.0 | 2 |"));
        assert!(markdown.contains("| Performance | ❌ failed | - | 0 |"));
        assert!(markdown.contains("Module failed: analysis timed out after 60s"));
    }

    #[tokio::test]
    async fn test_findings_are_sorted_by_severity() {
        let report = stored_report().await;
        let section = generate_findings_section(&report.modules);

        let critical = section.find("A11Y-003").unwrap();
        let serious = section.find("A11Y-001").unwrap();
        assert!(critical < serious);
    }

    #[test]
    fn test_generate_finding_block() {
        let finding = Finding {
            id: "f1".to_string(),
            job_id: "j1".to_string(),
            analysis_id: "a1".to_string(),
            module: crate::models::ModuleKind::Structure,
            rule_key: "structure.title".to_string(),
            rule_id: "STR-002".to_string(),
            severity: Severity::Serious,
            location: "document".to_string(),
            message: "Document has no <title>".to_string(),
            created_at: chrono::Utc::now(),
        };

        let block = generate_finding_block(&finding);
        assert!(block.contains("SERIOUS"));
        assert!(block.contains("`STR-002`"));
        assert!(block.contains("Document has no <title>"));
    }

    #[tokio::test]
    async fn test_generate_json_report() {
        let report = stored_report().await;
        let json = generate_json_report(&report).unwrap();

        assert!(json.contains("\"analysis\""));
        assert!(json.contains("\"partially_failed\""));
        assert!(json.contains("\"rule_id\": \"A11Y-003\""));
    }
}
