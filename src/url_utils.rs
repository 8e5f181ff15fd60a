//! URL helper functions used throughout the prober

use std::collections::HashSet;
use std::io::BufRead;

use url::Url;

/// Canonical `host:port` string for a URL, using the scheme default
/// (80/443) when no port is explicit. Groups URLs that share a server
/// without resolving anything.
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

/// Check whether a URL is eligible as a crawl or seed target
pub fn is_crawlable(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host_str().is_some()
}

/// Normalize one seed line into a URL, adding https:// when no scheme is
/// provided. Returns None for blank or unparseable input.
pub fn normalize_seed(line: &str) -> Option<Url> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let mut url = Url::parse(&candidate).ok()?;
    if !is_crawlable(&url) {
        return None;
    }
    url.port_or_known_default()?;
    url.set_fragment(None);
    Some(url)
}

/// Read seed URLs, one per line. Blank and unparseable lines are skipped.
pub fn read_seed_urls<R: BufRead>(reader: R) -> std::io::Result<Vec<Url>> {
    let mut seeds = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Some(url) = normalize_seed(&line) {
            seeds.push(url);
        } else if !line.trim().is_empty() {
            tracing::debug!(line = %line, "skipping unparseable seed line");
        }
    }
    Ok(seeds)
}

/// Drop URLs whose host key was already seen, preserving order
pub fn dedup_by_host_key(urls: Vec<Url>) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for url in urls {
        let Some(key) = host_key(&url) else { continue };
        if seen.insert(key) {
            unique.push(url);
        }
    }
    unique
}

/// The (path, query) pair that identifies a crawl target within one
/// connection. The fragment is dropped before anything reaches a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelativeUrl {
    path: String,
    query: Option<String>,
}

impl RelativeUrl {
    pub fn from_url(url: &Url) -> Self {
        Self {
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
        }
    }

    /// The `/robots.txt` target every connection visits first
    pub fn robots() -> Self {
        Self {
            path: "/robots.txt".to_string(),
            query: None,
        }
    }

    pub fn is_robots(&self) -> bool {
        self.path == "/robots.txt" && self.query.is_none()
    }

    /// Rebuild an absolute URL against the connection's seed
    pub fn resolve(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.set_path(&self.path);
        url.set_query(self.query.as_deref());
        url.set_fragment(None);
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_host_key_explicit_and_default_ports() {
        let explicit = Url::parse("http://test.local:8081/index.html").unwrap();
        assert_eq!(host_key(&explicit), Some("test.local:8081".to_string()));

        let http = Url::parse("http://test.local/").unwrap();
        assert_eq!(host_key(&http), Some("test.local:80".to_string()));

        let https = Url::parse("https://test.local/").unwrap();
        assert_eq!(host_key(&https), Some("test.local:443".to_string()));
    }

    #[test]
    fn test_normalize_seed_adds_scheme() {
        assert_eq!(
            normalize_seed("test.local").unwrap().as_str(),
            "https://test.local/"
        );
        assert_eq!(
            normalize_seed(" http://test.local/page ").unwrap().as_str(),
            "http://test.local/page"
        );
    }

    #[test]
    fn test_normalize_seed_rejects_junk() {
        assert!(normalize_seed("").is_none());
        assert!(normalize_seed("   ").is_none());
        assert!(normalize_seed("http://").is_none());
        assert!(normalize_seed("not a url at all").is_none());
    }

    #[test]
    fn test_normalize_seed_drops_fragment() {
        let url = normalize_seed("http://test.local/page#section").unwrap();
        assert_eq!(url.as_str(), "http://test.local/page");
    }

    #[test]
    fn test_read_seed_urls_skips_blank_and_bad_lines() {
        let input = Cursor::new("http://a.local/\n\nnot a url!?\nb.local\n");
        let seeds = read_seed_urls(input).unwrap();
        let seeds: Vec<&str> = seeds.iter().map(Url::as_str).collect();
        assert_eq!(seeds, vec!["http://a.local/", "https://b.local/"]);
    }

    #[test]
    fn test_dedup_by_host_key() {
        let urls = vec![
            Url::parse("http://a.local:8081/index.html").unwrap(),
            Url::parse("http://a.local:8081/other.html").unwrap(),
            Url::parse("http://a.local:8082/index.html").unwrap(),
        ];
        let unique = dedup_by_host_key(urls);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].path(), "/index.html");
        assert_eq!(unique[1].port(), Some(8082));
    }

    #[test]
    fn test_relative_url_identity_ignores_fragment() {
        let a = Url::parse("http://test.local/page?x=1#top").unwrap();
        let b = Url::parse("http://test.local/page?x=1#bottom").unwrap();
        assert_eq!(RelativeUrl::from_url(&a), RelativeUrl::from_url(&b));
    }

    #[test]
    fn test_relative_url_resolve() {
        let base = Url::parse("http://test.local:8081/index.html").unwrap();
        let rel = RelativeUrl::from_url(&Url::parse("http://ignored/blog.html?page=2").unwrap());
        let resolved = rel.resolve(&base);
        assert_eq!(resolved.as_str(), "http://test.local:8081/blog.html?page=2");
    }

    #[test]
    fn test_robots_is_first_class() {
        let rel = RelativeUrl::robots();
        assert!(rel.is_robots());
        let base = Url::parse("http://test.local:8081/deep/page.html").unwrap();
        assert_eq!(
            rel.resolve(&base).as_str(),
            "http://test.local:8081/robots.txt"
        );
    }
}
