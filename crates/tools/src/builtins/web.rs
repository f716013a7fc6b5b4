//! Web fetching — plain HTTP extraction and a JS-rendered variant.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;

use crate::{Tool, ToolCategory, ToolParam, ToolSpec, required_str};
use super::fs::truncate_byte_boundary;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Jina Reader prefix — renders JS and returns clean Markdown.
const JINA_READER_PREFIX: &str = "https://r.jina.ai/";

/// Maximum characters returned to the model.
const MAX_OUTPUT_CHARS: usize = 50_000;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

// ── read_website ─────────────────────────────────────────────────────────────

/// Fast HTTP fetch with tag-level content extraction.
pub struct ReadWebsiteTool;

#[async_trait]
impl Tool for ReadWebsiteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_website".to_string(),
            description: "Fetch and read content from a website URL. Returns clean markdown \
                          content. Fast HTTP-based fetching."
                .to_string(),
            category: ToolCategory::Web,
            params: vec![ToolParam::required("url", "Full URL to fetch")],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let url = required_str(args, "url")?;
        match fetch_and_extract(url).await {
            Ok(content) => Ok(content),
            // The model is allowed to observe fetch failures and react.
            Err(err) => Ok(format!("Error: {err}")),
        }
    }
}

async fn fetch_and_extract(url: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("HTTP {status} fetching {url}");
    }
    let html = response.text().await?;
    debug!(url, bytes = html.len(), "fetched page");
    Ok(extract_markdown(&html))
}

/// Walk content-bearing tags and render a markdown-ish text view, skipping
/// scripts, styles, navigation chrome, and forms entirely.
pub fn extract_markdown(html: &str) -> String {
    let document = Html::parse_document(html);
    let selector = Selector::parse("h1, h2, h3, h4, h5, h6, p, li, pre, blockquote, td, th")
        .expect("static selector");
    let skip = Selector::parse("nav, footer, header, aside, form, script, style, noscript")
        .expect("static selector");

    let skipped: Vec<_> = document.select(&skip).collect();
    let mut lines: Vec<String> = Vec::new();
    for element in document.select(&selector) {
        // Drop anything nested inside chrome/script containers.
        if skipped.iter().any(|s| {
            element
                .ancestors()
                .any(|ancestor| ancestor.id() == s.id())
        }) {
            continue;
        }
        let text = element.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            continue;
        }
        let line = match element.value().name() {
            "h1" => format!("# {text}"),
            "h2" => format!("## {text}"),
            "h3" => format!("### {text}"),
            "h4" | "h5" | "h6" => format!("#### {text}"),
            "li" => format!("- {text}"),
            "pre" => format!("```\n{text}\n```"),
            "blockquote" => format!("> {text}"),
            _ => text,
        };
        // Nested structures surface the same text twice (li > p); keep the
        // first occurrence only.
        let bare = line.trim_start_matches(['-', '#', '>', ' ']).to_string();
        if lines.last().is_none_or(|prev| !prev.ends_with(&bare)) {
            lines.push(line);
        }
    }

    let output = lines.join("\n");
    let end = truncate_byte_boundary(&output, MAX_OUTPUT_CHARS);
    output[..end].trim().to_string()
}

// ── read_website_js ──────────────────────────────────────────────────────────

/// JS-rendered variant routed through Jina Reader, which returns Markdown
/// directly.  Slower; for SPA-style sites only.
pub struct ReadWebsiteJsTool;

#[async_trait]
impl Tool for ReadWebsiteJsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_website_js".to_string(),
            description: "Fetch website with JavaScript rendering (slower, use only for \
                          JS-heavy sites like SPAs)."
                .to_string(),
            category: ToolCategory::Web,
            params: vec![ToolParam::required("url", "Full URL to fetch")],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let url = required_str(args, "url")?;
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        let rendered_url = format!("{JINA_READER_PREFIX}{url}");
        match client.get(&rendered_url).send().await {
            Ok(response) if response.status().is_success() => {
                let text = response.text().await.unwrap_or_default();
                let end = truncate_byte_boundary(&text, MAX_OUTPUT_CHARS);
                Ok(text[..end].trim().to_string())
            }
            Ok(response) => Ok(format!("Error: HTTP {} from renderer", response.status())),
            Err(err) => Ok(format!("Error: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_keeps_content_and_drops_chrome() {
        let html = r#"
            <html><head><style>p { color: red }</style></head><body>
              <nav><ul><li>Home</li><li>About</li></ul></nav>
              <h1>Release Notes</h1>
              <p>Version 2.0 ships  today.</p>
              <ul><li>Faster retrieval</li></ul>
              <script>trackPageView();</script>
              <footer><p>Copyright</p></footer>
            </body></html>
        "#;
        let markdown = extract_markdown(html);
        assert!(markdown.contains("# Release Notes"));
        assert!(markdown.contains("Version 2.0 ships today."));
        assert!(markdown.contains("- Faster retrieval"));
        assert!(!markdown.contains("Home"));
        assert!(!markdown.contains("trackPageView"));
        assert!(!markdown.contains("Copyright"));
        assert!(!markdown.contains("color: red"));
    }

    #[test]
    fn extraction_of_empty_document() {
        assert_eq!(extract_markdown("<html><body></body></html>"), "");
    }

    #[test]
    fn headings_map_to_markdown_levels() {
        let html = "<body><h2>Section</h2><h3>Subsection</h3></body>";
        let markdown = extract_markdown(html);
        assert!(markdown.contains("## Section"));
        assert!(markdown.contains("### Subsection"));
    }
}
