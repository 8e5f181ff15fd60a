//! Extracting outbound URLs from fetched HTML.

use scraper::{Html, Selector};
use url::Url;

use crate::url_utils;

/// Extract all `<a href>` targets from an HTML page as absolute URLs.
///
/// Relative hrefs are resolved against the document's `<base href>` when
/// present, otherwise against the request URL. The result keeps document
/// order and is deduplicated by (host, path); fragments are dropped.
pub fn scrap_html(request_url: &Url, body: &str) -> Vec<Url> {
    let document = Html::parse_document(body);
    let anchors = Selector::parse("a[href]").expect("Invalid CSS selector");

    let base = base_href(&document, request_url);

    let mut urls: Vec<Url> = Vec::new();
    for element in document.select(&anchors) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };

        let Ok(mut url) = base.join(href.trim()) else {
            continue;
        };
        if !url_utils::is_crawlable(&url) {
            continue;
        }
        url.set_fragment(None);

        let duplicate = urls
            .iter()
            .any(|u| u.host_str() == url.host_str() && u.path() == url.path());
        if !duplicate {
            urls.push(url);
        }
    }

    urls
}

/// Resolve the effective base URL: `<base href>` joined onto the request
/// URL when the document declares one, the request URL otherwise.
fn base_href(document: &Html, request_url: &Url) -> Url {
    let selector = Selector::parse("head base[href]").expect("Invalid CSS selector");
    document
        .select(&selector)
        .next()
        .and_then(|e| e.value().attr("href"))
        .and_then(|href| request_url.join(href.trim()).ok())
        .unwrap_or_else(|| request_url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://test.local:8081/index.html").unwrap()
    }

    #[test]
    fn test_absolute_and_relative_links() {
        let html = r#"<html><body>
            <a href="http://other.local:8082/page.html">other</a>
            <a href="/blog.html">blog</a>
            <a href="notes.html">notes</a>
        </body></html>"#;

        let urls = scrap_html(&base(), html);
        let urls: Vec<&str> = urls.iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            vec![
                "http://other.local:8082/page.html",
                "http://test.local:8081/blog.html",
                "http://test.local:8081/notes.html",
            ]
        );
    }

    #[test]
    fn test_base_href_applies_to_relative_links() {
        let html = r#"<html><head><base href="http://cdn.local:9000/pages/"></head>
            <body><a href="one.html">one</a><a href="http://abs.local/x.html">x</a></body></html>"#;

        let urls = scrap_html(&base(), html);
        let urls: Vec<&str> = urls.iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            vec![
                "http://cdn.local:9000/pages/one.html",
                "http://abs.local/x.html",
            ]
        );
    }

    #[test]
    fn test_dedup_by_host_and_path() {
        let html = r#"<html><body>
            <a href="/page.html">one</a>
            <a href="/page.html?variant=2">two</a>
            <a href="/page.html#section">three</a>
        </body></html>"#;

        let urls = scrap_html(&base(), html);
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].path(), "/page.html");
    }

    #[test]
    fn test_fragments_dropped() {
        let html = r#"<a href="/page.html#summary">jump</a>"#;
        let urls = scrap_html(&base(), html);
        assert_eq!(urls[0].fragment(), None);
    }

    #[test]
    fn test_non_http_schemes_skipped() {
        let html = r#"<html><body>
            <a href="mailto:ops@test.local">mail</a>
            <a href="javascript:void(0)">js</a>
            <a href="/real.html">real</a>
        </body></html>"#;

        let urls = scrap_html(&base(), html);
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].path(), "/real.html");
    }

    #[test]
    fn test_no_links() {
        let html = "<html><body><h1>Nothing here</h1></body></html>";
        assert!(scrap_html(&base(), html).is_empty());
    }

    #[test]
    fn test_malformed_html_is_tolerated() {
        let html = r#"<html><body><a href="/ok.html">ok<div><p>unclosed"#;
        let urls = scrap_html(&base(), html);
        assert_eq!(urls.len(), 1);
    }
}
