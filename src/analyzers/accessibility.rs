//! Accessibility checks over the captured markup.

use super::html::{attr, has_attr, has_nonempty_attr, inside, selector, text, Page};
use super::{Analyzer, RawFinding};
use crate::assets::AssetBundle;
use crate::models::{ModuleKind, Severity};
use async_trait::async_trait;
use scraper::ElementRef;
use std::collections::HashSet;

/// Input types that never need a visible label.
const UNLABELLED_INPUT_TYPES: &[&str] = &["hidden", "submit", "reset", "button", "image"];

pub struct AccessibilityAnalyzer;

impl AccessibilityAnalyzer {
    fn has_accessible_name(element: ElementRef<'_>) -> bool {
        has_nonempty_attr(element, "aria-label")
            || has_nonempty_attr(element, "aria-labelledby")
            || has_nonempty_attr(element, "title")
    }

    /// Visible text, or the alt text of an image inside the element.
    fn has_content_name(element: ElementRef<'_>) -> anyhow::Result<bool> {
        if !text(element).is_empty() {
            return Ok(true);
        }
        let images = selector("img[alt]")?;
        let named = element
            .select(&images)
            .any(|img| has_nonempty_attr(img, "alt"));
        Ok(named)
    }

    fn check_images(page: &Page, findings: &mut Vec<RawFinding>) -> anyhow::Result<()> {
        for img in page.select("img")? {
            // alt="" is a valid way to mark an image decorative.
            if !has_attr(img, "alt") && !has_nonempty_attr(img, "aria-label") {
                let src = attr(img, "src").unwrap_or("(inline)");
                findings.push(RawFinding::new(
                    "a11y.img-alt",
                    Severity::Serious,
                    page.locate(img)?,
                    format!("Image {} has no alt attribute", src),
                ));
            }
        }
        Ok(())
    }

    fn check_language(page: &Page, findings: &mut Vec<RawFinding>) {
        if !has_nonempty_attr(page.root(), "lang") {
            findings.push(RawFinding::new(
                "a11y.html-lang",
                Severity::Serious,
                "html",
                "The <html> element does not declare a lang attribute",
            ));
        }
    }

    fn check_form_controls(page: &Page, findings: &mut Vec<RawFinding>) -> anyhow::Result<()> {
        let labelled: HashSet<&str> = page
            .select("label[for]")?
            .into_iter()
            .filter_map(|label| attr(label, "for"))
            .collect();

        for control in page.select("input, select, textarea")? {
            let name = control.value().name();
            if name == "input" {
                let input_type = attr(control, "type").unwrap_or("text").to_lowercase();
                if UNLABELLED_INPUT_TYPES.contains(&input_type.as_str()) {
                    continue;
                }
            }

            let has_label = inside(control, "label")
                || attr(control, "id").is_some_and(|id| labelled.contains(id));
            if !has_label && !Self::has_accessible_name(control) {
                findings.push(RawFinding::new(
                    "a11y.control-label",
                    Severity::Critical,
                    page.locate(control)?,
                    format!("Form control <{}> has no associated label", name),
                ));
            }
        }
        Ok(())
    }

    fn check_names(page: &Page, findings: &mut Vec<RawFinding>) -> anyhow::Result<()> {
        for link in page.select("a[href]")? {
            if !Self::has_content_name(link)? && !Self::has_accessible_name(link) {
                findings.push(RawFinding::new(
                    "a11y.link-name",
                    Severity::Moderate,
                    page.locate(link)?,
                    "Link has no discernible text",
                ));
            }
        }

        for button in page.select("button")? {
            if !Self::has_content_name(button)? && !Self::has_accessible_name(button) {
                findings.push(RawFinding::new(
                    "a11y.button-name",
                    Severity::Critical,
                    page.locate(button)?,
                    "Button has no discernible text",
                ));
            }
        }
        Ok(())
    }

    fn inspect(html: &str) -> anyhow::Result<Vec<RawFinding>> {
        let page = Page::parse(html);
        let mut findings = Vec::new();

        Self::check_language(&page, &mut findings);
        Self::check_images(&page, &mut findings)?;
        Self::check_form_controls(&page, &mut findings)?;
        Self::check_names(&page, &mut findings)?;

        Ok(findings)
    }
}

#[async_trait]
impl Analyzer for AccessibilityAnalyzer {
    fn module(&self) -> ModuleKind {
        ModuleKind::Accessibility
    }

    async fn analyze(&self, assets: &AssetBundle) -> anyhow::Result<Vec<RawFinding>> {
        Self::inspect(&assets.html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::sample_bundle;

    async fn rule_keys(html: &str) -> Vec<String> {
        AccessibilityAnalyzer
            .analyze(&sample_bundle(html))
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.rule_key)
            .collect()
    }

    #[tokio::test]
    async fn test_clean_page_has_no_findings() {
        let html = r#"<html lang="en"><body>
            <img src="logo.png" alt="Company logo">
            <img src="divider.png" alt="">
            <label for="q">Search</label><input id="q" type="search">
            <input type="hidden" name="csrf">
            <a href="/docs">Docs</a>
            <button aria-label="Close"><svg></svg></button>
        </body></html>"#;

        assert!(rule_keys(html).await.is_empty());
    }

    #[tokio::test]
    async fn test_reports_each_violation() {
        let html = r#"<html><body>
            <img src="hero.png">
            <input type="email" name="email">
            <a href="/x"><img src="icon.png" alt=""></a>
            <button></button>
        </body></html>"#;

        let keys = rule_keys(html).await;
        assert!(keys.contains(&"a11y.html-lang".to_string()));
        assert!(keys.contains(&"a11y.img-alt".to_string()));
        assert!(keys.contains(&"a11y.control-label".to_string()));
        assert!(keys.contains(&"a11y.link-name".to_string()));
        assert!(keys.contains(&"a11y.button-name".to_string()));
    }

    #[tokio::test]
    async fn test_unlabelled_control_is_critical() {
        let findings = AccessibilityAnalyzer
            .analyze(&sample_bundle(r#"<html lang="en"><textarea></textarea></html>"#))
            .await
            .unwrap();

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_key, "a11y.control-label");
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].location, "textarea[1]");
    }

    #[tokio::test]
    async fn test_commented_markup_and_wrapping_labels() {
        let html = r#"<html lang="en"><body>
            <!-- <img src="old-banner.png"> -->
            <label>Email <input type="email"></label>
        </body></html>"#;

        assert!(rule_keys(html).await.is_empty());
    }

    #[tokio::test]
    async fn test_findings_name_the_element() {
        let findings = AccessibilityAnalyzer
            .analyze(&sample_bundle(
                r#"<html lang="en"><img src="hero.png"><select name="country"></select></html>"#,
            ))
            .await
            .unwrap();

        let locations: Vec<&str> = findings.iter().map(|f| f.location.as_str()).collect();
        assert_eq!(locations, vec![r#"img[src="hero.png"]"#, r#"select[name="country"]"#]);
    }
}
