//! Document structure checks: doctype, title, headings and head metadata.

use super::html::{attr, has_nonempty_attr, text, Page};
use super::{Analyzer, RawFinding};
use crate::assets::AssetBundle;
use crate::models::{ModuleKind, Severity};
use async_trait::async_trait;

pub struct StructureAnalyzer;

impl StructureAnalyzer {
    fn check_doctype(page: &Page, findings: &mut Vec<RawFinding>) {
        if !page.has_html_doctype() {
            findings.push(RawFinding::new(
                "structure.doctype",
                Severity::Minor,
                "document",
                "Document does not declare <!DOCTYPE html>",
            ));
        }
    }

    fn check_title(page: &Page, findings: &mut Vec<RawFinding>) -> anyhow::Result<()> {
        match page.select("title")?.first() {
            Some(title) if !text(*title).is_empty() => {}
            Some(_) => findings.push(RawFinding::new(
                "structure.title",
                Severity::Serious,
                "title",
                "The <title> element is empty",
            )),
            None => findings.push(RawFinding::new(
                "structure.title",
                Severity::Serious,
                "document",
                "Document has no <title>",
            )),
        }
        Ok(())
    }

    fn check_headings(page: &Page, findings: &mut Vec<RawFinding>) -> anyhow::Result<()> {
        let levels = page.headings()?;

        let h1s: Vec<&str> = levels
            .iter()
            .filter(|(level, _)| *level == 1)
            .map(|(_, location)| location.as_str())
            .collect();
        match h1s.as_slice() {
            [] => findings.push(RawFinding::new(
                "structure.h1",
                Severity::Moderate,
                "document",
                "Document has no <h1> heading",
            )),
            [_] => {}
            [_, second, ..] => findings.push(RawFinding::new(
                "structure.h1",
                Severity::Minor,
                *second,
                format!("Document has {} <h1> headings", h1s.len()),
            )),
        }

        let mut previous: Option<u8> = None;
        for (level, location) in &levels {
            if let Some(prev) = previous {
                if *level > prev + 1 {
                    findings.push(RawFinding::new(
                        "structure.heading-order",
                        Severity::Moderate,
                        location.clone(),
                        format!("Heading level skips from h{} to h{}", prev, level),
                    ));
                }
            }
            previous = Some(*level);
        }
        Ok(())
    }

    fn check_meta(page: &Page, findings: &mut Vec<RawFinding>) -> anyhow::Result<()> {
        let metas = page.select("head meta[name]")?;
        let has_meta = |name: &str| {
            metas.iter().any(|meta| {
                attr(*meta, "name").is_some_and(|n| n.eq_ignore_ascii_case(name))
                    && has_nonempty_attr(*meta, "content")
            })
        };

        if !has_meta("description") {
            findings.push(RawFinding::new(
                "structure.meta-description",
                Severity::Minor,
                "head",
                "No <meta name=\"description\"> in the document head",
            ));
        }
        if !has_meta("viewport") {
            findings.push(RawFinding::new(
                "structure.viewport",
                Severity::Moderate,
                "head",
                "No <meta name=\"viewport\"> in the document head",
            ));
        }
        Ok(())
    }

    fn inspect(html: &str) -> anyhow::Result<Vec<RawFinding>> {
        let page = Page::parse(html);
        let mut findings = Vec::new();

        Self::check_doctype(&page, &mut findings);
        Self::check_title(&page, &mut findings)?;
        Self::check_headings(&page, &mut findings)?;
        Self::check_meta(&page, &mut findings)?;

        Ok(findings)
    }
}

#[async_trait]
impl Analyzer for StructureAnalyzer {
    fn module(&self) -> ModuleKind {
        ModuleKind::Structure
    }

    async fn analyze(&self, assets: &AssetBundle) -> anyhow::Result<Vec<RawFinding>> {
        Self::inspect(&assets.html)
    }
}
