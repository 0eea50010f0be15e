//! HTML inspection helpers over a parsed document.
//!
//! Parsed nodes carry no source position, so findings name an element by
//! locator instead of a line: `tag#id`, `tag[attr="value"]` for the first
//! identifying attribute present, or `tag[n]` for the n-th such tag in
//! document order.

use anyhow::{anyhow, Result};
use scraper::{ElementRef, Html, Node, Selector};

/// Attributes that identify an element well enough to name it.
const IDENTIFYING_ATTRS: &[&str] = &["name", "src", "href", "for"];

/// A parsed page. Comments and script bodies are never read as markup.
pub struct Page {
    document: Html,
}

impl Page {
    pub fn parse(html: &str) -> Self {
        Self {
            document: Html::parse_document(html),
        }
    }

    /// Elements matching a CSS selector, in document order.
    pub fn select(&self, css: &str) -> Result<Vec<ElementRef<'_>>> {
        let selector = selector(css)?;
        Ok(self.document.select(&selector).collect())
    }

    /// The `<html>` element. The parser creates one when the markup omits it.
    pub fn root(&self) -> ElementRef<'_> {
        self.document.root_element()
    }

    pub fn has_html_doctype(&self) -> bool {
        self.document.tree.root().children().any(|node| match node.value() {
            Node::Doctype(doctype) => doctype.name().eq_ignore_ascii_case("html"),
            _ => false,
        })
    }

    /// Heading levels (1-6) in document order, with their locators.
    pub fn headings(&self) -> Result<Vec<(u8, String)>> {
        let mut levels = Vec::new();
        for heading in self.select("h1, h2, h3, h4, h5, h6")? {
            let level = heading.value().name()[1..].parse().unwrap_or(1);
            levels.push((level, self.locate(heading)?));
        }
        Ok(levels)
    }

    /// A short, stable name for `element`.
    pub fn locate(&self, element: ElementRef<'_>) -> Result<String> {
        let tag = element.value().name();
        if let Some(id) = attr(element, "id").filter(|id| !id.trim().is_empty()) {
            return Ok(format!("{}#{}", tag, id));
        }
        for name in IDENTIFYING_ATTRS {
            if let Some(value) = attr(element, name).filter(|v| !v.trim().is_empty()) {
                return Ok(format!("{}[{}=\"{}\"]", tag, name, value));
            }
        }
        let position = self
            .select(tag)?
            .iter()
            .position(|other| other.id() == element.id())
            .unwrap_or(0);
        Ok(format!("{}[{}]", tag, position + 1))
    }
}

pub fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector '{}': {:?}", css, e))
}

pub fn attr<'a>(element: ElementRef<'a>, name: &str) -> Option<&'a str> {
    element.value().attr(name)
}

pub fn has_attr(element: ElementRef<'_>, name: &str) -> bool {
    attr(element, name).is_some()
}

/// Attribute present with a non-blank value.
pub fn has_nonempty_attr(element: ElementRef<'_>, name: &str) -> bool {
    attr(element, name).is_some_and(|v| !v.trim().is_empty())
}

/// Text content with whitespace collapsed.
pub fn text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether any ancestor of `element` is a `tag` element.
pub fn inside(element: ElementRef<'_>, tag: &str) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| ancestor.value().name() == tag)
}
