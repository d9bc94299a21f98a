// sum.rs - Link discovery and webpage fetching for link summaries
//
// Messages that contain URLs get their linked page fetched, reduced to plain
// text, and summarized by the text model in the LinkSummary stage.

use crate::error::{DigestError, DigestResult};
use crate::observe::Observer;
use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

/// Page text handed to the model is capped at this many characters.
pub const MAX_PAGE_CHARS: usize = 15000;

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^\s<>"']+"#).expect("url pattern is valid")
});

static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag pattern is valid"));

#[async_trait]
pub trait LinkFetcher: Send + Sync {
    /// Returns the readable text of the page at `url`.
    async fn fetch(&self, url: &str) -> DigestResult<String>;
}

pub struct WebFetcher {
    client: reqwest::Client,
    observer: Observer,
}

impl WebFetcher {
    pub fn new(timeout: Duration, observer: &Observer) -> DigestResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()?;
        Ok(Self {
            client,
            observer: observer.scoped("web"),
        })
    }
}

#[async_trait]
impl LinkFetcher for WebFetcher {
    async fn fetch(&self, url: &str) -> DigestResult<String> {
        let target = self.observer.target();
        debug!(target: target, "🌐 Fetching {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        debug!(target: target, "📡 HTTP Response Status: {}", status);

        if !status.is_success() {
            return Err(DigestError::Api {
                status: status.as_u16(),
                body: format!("fetching {}", url),
            });
        }

        let html = response.text().await?;
        let cleaned = clean_html(&html);
        debug!(target: target, "🧹 HTML cleaned: {} -> {} characters", html.len(), cleaned.len());
        Ok(cleaned)
    }
}

/// URLs in message order, trailing punctuation trimmed, duplicates removed.
pub fn extract_links(text: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for found in URL_PATTERN.find_iter(text) {
        let url = found
            .as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')' | ']'))
            .to_string();
        if !links.contains(&url) {
            links.push(url);
        }
    }
    links
}

pub fn clean_html(html: &str) -> String {
    let mut result = html.to_string();

    for (open, close) in [("<script", "</script>"), ("<style", "</style>")] {
        while let Some(start) = result.find(open) {
            match result[start..].find(close) {
                Some(end) => result.replace_range(start..start + end + close.len(), ""),
                None => break,
            }
        }
    }

    let cleaned = TAG_PATTERN.replace_all(&result, " ");

    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_PAGE_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_html() {
        let html = "<p>Hello <b>world</b></p><script>alert('test');</script><style>p{}</style>";
        assert_eq!(clean_html(html), "Hello world");
    }

    #[test]
    fn test_clean_html_truncates() {
        let html = format!("<div>{}</div>", "a".repeat(MAX_PAGE_CHARS + 100));
        assert_eq!(clean_html(&html).len(), MAX_PAGE_CHARS);
    }

    #[test]
    fn test_extract_links() {
        let text = "See https://example.com/trail. Also (http://maps.example.org/x?y=1), and https://example.com/trail again";
        assert_eq!(
            extract_links(text),
            vec![
                "https://example.com/trail".to_string(),
                "http://maps.example.org/x?y=1".to_string(),
            ]
        );
        assert!(extract_links("no links here").is_empty());
    }
}
