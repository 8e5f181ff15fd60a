//! Resolving URLs to IPv4 endpoints via the system resolver.

use std::net::SocketAddr;

use url::Url;

use crate::url_utils;

/// A URL together with the endpoints it resolved to, in resolver order.
/// An empty endpoint list means resolution failed or yielded nothing
/// usable; that is not an error, just a URL that births no connection.
#[derive(Debug, Clone)]
pub struct ResolvedUrl {
    pub url: Url,
    pub addresses: Vec<SocketAddr>,
}

/// Resolve a URL's host to IPv4 endpoints carrying the URL's port.
///
/// Only IPv4 is looked up: IPv6 addresses are not running out, so there
/// is no CGNAT in front of them and nothing to measure.
pub async fn resolve_ipv4(url: Url) -> ResolvedUrl {
    let mut resolved = ResolvedUrl {
        url,
        addresses: Vec::new(),
    };

    let Some(host) = resolved.url.host_str().map(str::to_string) else {
        return resolved;
    };
    let Some(port) = resolved.url.port_or_known_default() else {
        return resolved;
    };

    match tokio::net::lookup_host((host.as_str(), port)).await {
        Ok(addrs) => {
            resolved.addresses = addrs.filter(SocketAddr::is_ipv4).collect();
            tracing::debug!(
                host = %url_utils::host_key(&resolved.url).unwrap_or_default(),
                endpoints = resolved.addresses.len(),
                "resolved host"
            );
        }
        Err(e) => {
            tracing::debug!(host = %host, error = %e, "lookup failed");
        }
    }
    resolved
}
