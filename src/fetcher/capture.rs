//! Page capture over HTTP.

use crate::analyzers::html::{attr, Page};
use crate::assets::{AssetBundle, ResourceKind, ResourceRef};
use crate::error::CaptureError;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Retrieves a page and everything the analyzers need from it.
#[async_trait]
pub trait Capturer: Send + Sync {
    async fn capture(&self, url: &str) -> Result<AssetBundle, CaptureError>;
}

/// Fetches the document with `reqwest`. Produces no rendered snapshot.
pub struct HttpCapturer {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpCapturer {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client, timeout })
    }

    fn map_error(&self, e: reqwest::Error) -> CaptureError {
        if e.is_timeout() {
            CaptureError::Timeout(self.timeout.as_secs())
        } else {
            CaptureError::Http(e)
        }
    }
}

#[async_trait]
impl Capturer for HttpCapturer {
    async fn capture(&self, url: &str) -> Result<AssetBundle, CaptureError> {
        let started = Instant::now();
        debug!("Capturing {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(CaptureError::Status {
                url: final_url,
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(ref ct) = content_type {
            if !ct.to_lowercase().contains("html") {
                return Err(CaptureError::UnsupportedContent(ct.clone()));
            }
        }

        let html = response.text().await.map_err(|e| self.map_error(e))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let resources = extract_resources(&html, &final_url).unwrap_or_else(|e| {
            warn!("Could not extract resources from {}: {}", final_url, e);
            Vec::new()
        });

        debug!(
            "Captured {} ({} bytes, {} resources) in {}ms",
            final_url,
            html.len(),
            resources.len(),
            elapsed_ms
        );

        Ok(AssetBundle {
            target_url: url.to_string(),
            final_url,
            http_status: status.as_u16(),
            content_type,
            html,
            resources,
            snapshot: None,
            fetched_at: Utc::now(),
            elapsed_ms,
        })
    }
}

/// Scripts, stylesheets and images referenced by the page, resolved
/// against `base_url`. Unresolvable references are kept verbatim.
pub fn extract_resources(html: &str, base_url: &str) -> anyhow::Result<Vec<ResourceRef>> {
    let base = Url::parse(base_url).ok();
    let resolve = |reference: &str| match base.as_ref().and_then(|b| b.join(reference).ok()) {
        Some(url) => url.to_string(),
        None => reference.to_string(),
    };

    let page = Page::parse(html);
    let mut resources = Vec::new();

    for script in page.select("script[src]")? {
        if let Some(src) = attr(script, "src") {
            resources.push(ResourceRef {
                kind: ResourceKind::Script,
                url: resolve(src),
            });
        }
    }

    for link in page.select("link[rel][href]")? {
        let is_stylesheet = attr(link, "rel")
            .is_some_and(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("stylesheet")));
        if let (true, Some(href)) = (is_stylesheet, attr(link, "href")) {
            resources.push(ResourceRef {
                kind: ResourceKind::Stylesheet,
                url: resolve(href),
            });
        }
    }

    for img in page.select("img[src]")? {
        if let Some(src) = attr(img, "src") {
            resources.push(ResourceRef {
                kind: ResourceKind::Image,
                url: resolve(src),
            });
        }
    }

    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_resources_resolves_relative_urls() {
        let html = r#"<html><head>
            <link rel="stylesheet" href="/css/site.css">
            <link rel="icon" href="/favicon.ico">
            <script src="app.js"></script>
            <script>inline()</script>
        </head><body><img src="https://cdn.example.net/logo.png"></body></html>"#;

        let resources = extract_resources(html, "https://example.com/docs/").unwrap();
        assert_eq!(
            resources,
            vec![
                ResourceRef {
                    kind: ResourceKind::Script,
                    url: "https://example.com/docs/app.js".to_string(),
                },
                ResourceRef {
                    kind: ResourceKind::Stylesheet,
                    url: "https://example.com/css/site.css".to_string(),
                },
                ResourceRef {
                    kind: ResourceKind::Image,
                    url: "https://cdn.example.net/logo.png".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_extract_resources_without_base() {
        let resources = extract_resources(r#"<img src="a.png">"#, "not a url").unwrap();
        assert_eq!(resources[0].url, "a.png");
    }

    #[test]
    fn test_extract_resources_skips_commented_markup() {
        let html = r#"<html><body>
            <!-- <script src="legacy.js"></script> -->
            <script>var tpl = '<img src="tpl.png">';</script>
            <img src="/real.png">
        </body></html>"#;

        let resources = extract_resources(html, "https://example.com/").unwrap();
        assert_eq!(
            resources,
            vec![ResourceRef {
                kind: ResourceKind::Image,
                url: "https://example.com/real.png".to_string(),
            }]
        );
    }

    #[test]
    fn test_http_capturer_builds() {
        assert!(HttpCapturer::new(Duration::from_secs(5), "pageaudit-test").is_ok());
    }
}
