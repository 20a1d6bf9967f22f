use std::{net::IpAddr, time::Instant};

use common::error::AppError;
use dom_smoothie::{Article, Readability, TextMode};
use tracing::{info, warn};

/// Readable text pulled out of an HTML page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPage {
    pub title: String,
    pub text: String,
}

pub async fn extract_text_from_url(
    client: &reqwest::Client,
    url: &str,
    allow_private: bool,
) -> Result<ExtractedPage, AppError> {
    info!("Fetching URL: {}", url);
    let now = Instant::now();

    let parsed_url =
        url::Url::parse(url).map_err(|_| AppError::Validation("Invalid URL".to_string()))?;
    ensure_ingestion_url_allowed(&parsed_url, allow_private)?;

    let raw_content = client
        .get(parsed_url.as_str())
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let page = extract_text_from_html(raw_content, Some(parsed_url.as_str()))?;
    info!(
        "URL: {}. Total time: {:?}. Extracted {} chars",
        url,
        now.elapsed(),
        page.text.chars().count()
    );

    Ok(page)
}

/// Run readability over `html` and return its markdown rendering.
pub fn extract_text_from_html(
    html: String,
    document_url: Option<&str>,
) -> Result<ExtractedPage, AppError> {
    let config = dom_smoothie::Config {
        text_mode: TextMode::Markdown,
        ..Default::default()
    };
    let mut readability = Readability::new(html, document_url, Some(config))?;
    let article: Article = readability.parse()?;

    Ok(ExtractedPage {
        title: article.title.to_string(),
        text: article.text_content.to_string(),
    })
}

pub fn ensure_ingestion_url_allowed(
    url: &url::Url,
    allow_private: bool,
) -> Result<String, AppError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            warn!(%url, %scheme, "Rejected ingestion URL due to unsupported scheme");
            return Err(AppError::Validation(
                "Unsupported URL scheme for ingestion".to_string(),
            ));
        }
    }

    let Some(host) = url.host_str() else {
        warn!(%url, "Rejected ingestion URL missing host");
        return Err(AppError::Validation(
            "URL is missing a host component".to_string(),
        ));
    };

    if allow_private {
        return Ok(host.replace(|c: char| !c.is_alphanumeric(), "_"));
    }

    if host.eq_ignore_ascii_case("localhost") {
        warn!(%url, host, "Rejected ingestion URL to localhost");
        return Err(AppError::Validation(
            "Ingestion URL host is not allowed".to_string(),
        ));
    }

    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        let is_disallowed = match ip {
            IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
            IpAddr::V6(v6) => v6.is_unique_local() || v6.is_unicast_link_local(),
        };

        if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || is_disallowed {
            warn!(%url, host, %ip, "Rejected ingestion URL pointing to restricted network range");
            return Err(AppError::Validation(
                "Ingestion URL host is not allowed".to_string(),
            ));
        }
    }

    Ok(host.replace(|c: char| !c.is_alphanumeric(), "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_scheme() {
        let url = url::Url::parse("ftp://example.com").expect("url");
        assert!(ensure_ingestion_url_allowed(&url, false).is_err());
    }

    #[test]
    fn rejects_localhost_unless_private_allowed() {
        let url = url::Url::parse("http://localhost/resource").expect("url");
        assert!(ensure_ingestion_url_allowed(&url, false).is_err());
        assert!(ensure_ingestion_url_allowed(&url, true).is_ok());
    }

    #[test]
    fn rejects_private_ipv4() {
        let url = url::Url::parse("http://192.168.1.10/index.html").expect("url");
        assert!(ensure_ingestion_url_allowed(&url, false).is_err());
    }

    #[test]
    fn allows_public_domain_and_sanitizes() {
        let url = url::Url::parse("https://sub.example.com/path").expect("url");
        let sanitized = ensure_ingestion_url_allowed(&url, false).expect("allowed");
        assert_eq!(sanitized, "sub_example_com");
    }

    #[test]
    fn extracts_article_text_from_html() {
        let html = r#"<html><head><title>Release notes</title></head><body>
            <article><h1>Release notes</h1>
            <p>The ingestion worker now resumes interrupted FAQ imports from the last completed batch,
            which keeps large uploads from starting over after a restart.</p>
            <p>Deleting a knowledge base removes its chunks from every configured retrieval engine
            and reports engines that could not be reached.</p></article></body></html>"#;
        let page = extract_text_from_html(html.to_string(), None).expect("extract");
        assert!(page.text.contains("resumes interrupted FAQ imports"));
    }
}
