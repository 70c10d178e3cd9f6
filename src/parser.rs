//! HTML link extraction.

use scraper::{Html, Selector};
use url::Url;

use crate::url_utils;

/// Extract raw href values from anchor tags, skipping non-navigational
/// schemes.
pub fn extract_links(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = match Selector::parse("a[href]") {
        Ok(selector) => selector,
        Err(_) => return Vec::new(),
    };

    let mut links = Vec::new();
    for element in document.select(&selector) {
        if let Some(href) = element.value().attr("href") {
            let href = href.trim();
            if href.is_empty()
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
                || href.starts_with("data:")
                || href.starts_with("file:")
            {
                continue;
            }
            links.push(href.to_string());
        }
    }
    links
}

/// Links from a page resolved to absolute, crawlable, fragment-free URLs.
pub fn discovered_urls(base: &Url, html: &str) -> Vec<Url> {
    extract_links(html)
        .iter()
        .filter_map(|link| url_utils::resolve(link, base))
        .map(url_utils::normalize)
        .filter(url_utils::should_crawl)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_hrefs() {
        let html = r#"<html><body>
            <a href="https://a.com/1">one</a>
            <a href="/relative">two</a>
            <a href="mailto:x@y.z">mail</a>
            <a href="javascript:void(0)">js</a>
        </body></html>"#;
        assert_eq!(extract_links(html), vec!["https://a.com/1", "/relative"]);
    }

    #[test]
    fn test_discovered_urls_resolves_and_filters() {
        let base = Url::parse("https://a.com/dir/page").unwrap();
        let html = r#"<html><body>
            <a href="/top">top</a>
            <a href="next">sibling</a>
            <a href="https://b.com/x#frag">external</a>
            <a href="ftp://c.com/file">ftp</a>
        </body></html>"#;

        let urls: Vec<String> = discovered_urls(&base, html)
            .iter()
            .map(|u| u.to_string())
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://a.com/top",
                "https://a.com/dir/next",
                "https://b.com/x",
            ]
        );
    }

    #[test]
    fn test_malformed_html_is_tolerated() {
        let html = r#"<a href="https://a.com/ok">ok<div><p>unclosed"#;
        assert_eq!(extract_links(html), vec!["https://a.com/ok"]);
    }
}
