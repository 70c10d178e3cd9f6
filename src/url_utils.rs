//! URL helpers shared by the frontier, the workers and the parser.

use url::Url;

/// Scheduling and dedup key for a URL: the registered hostname, lowercased.
/// Returns `None` for URLs without an absolute host (relative, mailto, etc).
pub fn host_key(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_ascii_lowercase())
}

/// Parse an absolute URL, requiring a host component.
pub fn parse_absolute(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    url.host_str()?;
    Some(url)
}

/// Resolve a link against the page it was found on.
pub fn resolve(link: &str, base: &Url) -> Option<Url> {
    base.join(link.trim()).ok()
}

/// Remove the fragment portion so equivalent pages dedup together.
pub fn normalize(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

/// Whether a URL is eligible for crawling at all.
pub fn should_crawl(url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    url.host_str().is_some()
}

/// robots.txt location for the given URL's host.
pub fn robots_url(url: &Url) -> Option<Url> {
    let mut robots = url.clone();
    robots.set_path("/robots.txt");
    robots.set_query(None);
    robots.set_fragment(None);
    Some(robots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_lowercases() {
        let url = Url::parse("https://WWW.Example.COM/Path").unwrap();
        assert_eq!(host_key(&url), Some("www.example.com".to_string()));
    }

    #[test]
    fn test_parse_absolute_requires_host() {
        assert!(parse_absolute("https://example.com/a").is_some());
        assert!(parse_absolute("mailto:someone@example.com").is_none());
        assert!(parse_absolute("/relative/path").is_none());
        assert!(parse_absolute("not a url").is_none());
    }

    #[test]
    fn test_resolve_relative_links() {
        let base = Url::parse("https://example.com/dir/page").unwrap();
        assert_eq!(
            resolve("/about", &base).unwrap().as_str(),
            "https://example.com/about"
        );
        assert_eq!(
            resolve("sub", &base).unwrap().as_str(),
            "https://example.com/dir/sub"
        );
    }

    #[test]
    fn test_normalize_strips_fragment() {
        let url = Url::parse("https://example.com/page#section").unwrap();
        assert_eq!(normalize(url).as_str(), "https://example.com/page");
    }

    #[test]
    fn test_should_crawl_schemes() {
        assert!(should_crawl(&Url::parse("http://a.com/x").unwrap()));
        assert!(should_crawl(&Url::parse("https://a.com/x").unwrap()));
        assert!(!should_crawl(&Url::parse("ftp://a.com/x").unwrap()));
    }

    #[test]
    fn test_robots_url() {
        let url = Url::parse("https://example.com/deep/path?q=1").unwrap();
        assert_eq!(
            robots_url(&url).unwrap().as_str(),
            "https://example.com/robots.txt"
        );
    }
}
