//! URL normalization for the active tab.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Which URL components to keep in collected samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlComponents {
    pub protocol: bool,
    pub domain: bool,
    pub path: bool,
    pub query: bool,
    pub fragment: bool,
}

impl Default for UrlComponents {
    fn default() -> Self {
        Self {
            protocol: true,
            domain: true,
            path: false,
            query: false,
            fragment: false,
        }
    }
}

impl UrlComponents {
    /// Keep every component.
    pub fn all() -> Self {
        Self {
            protocol: true,
            domain: true,
            path: true,
            query: true,
            fragment: true,
        }
    }

    /// Keep nothing.
    pub fn none() -> Self {
        Self {
            protocol: false,
            domain: false,
            path: false,
            query: false,
            fragment: false,
        }
    }

    /// Parse a comma-separated component list, e.g. `protocol,domain,path`.
    pub fn from_csv(s: &str) -> Self {
        let parts: Vec<String> = s.split(',').map(|p| p.trim().to_lowercase()).collect();
        if parts.iter().any(|p| p == "all") {
            return Self::all();
        }

        Self {
            protocol: parts.iter().any(|p| p == "protocol"),
            domain: parts.iter().any(|p| p == "domain"),
            path: parts.iter().any(|p| p == "path"),
            query: parts.iter().any(|p| p == "query"),
            fragment: parts.iter().any(|p| p == "fragment"),
        }
    }
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.*?)://([^/]*?)(?:/|$)([^?]*?)(?:(?:\?|$)([^#]*?))?(?:#|$)(.*?)$")
            .expect("URL pattern is valid")
    })
}

/// Rebuild `raw` keeping only the selected components.
///
/// Components are emitted in protocol, domain, path, query, fragment order.
/// A query or fragment missing from the source is left out even when
/// selected. Returns `None` when `raw` is not of the form
/// `scheme://authority[/path][?query][#fragment]`.
pub fn normalize_url(raw: &str, components: &UrlComponents) -> Option<String> {
    let caps = url_pattern().captures(raw)?;
    let part = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or("");

    let mut out = String::new();
    if components.protocol {
        out.push_str(part(1));
        out.push_str("://");
    }
    if components.domain {
        out.push_str(part(2));
        out.push('/');
    }
    if components.path {
        out.push_str(part(3));
    }
    if components.query && !part(4).is_empty() {
        out.push('?');
        out.push_str(part(4));
    }
    if components.fragment && !part(5).is_empty() {
        out.push('#');
        out.push_str(part(5));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "https://example.com/docs/page?lang=en&v=2#intro";

    #[test]
    fn test_components_from_csv() {
        let components = UrlComponents::from_csv("Domain, path");
        assert!(!components.protocol);
        assert!(components.domain && components.path);
        assert!(!components.query && !components.fragment);

        assert_eq!(UrlComponents::from_csv("all"), UrlComponents::all());
        assert_eq!(UrlComponents::from_csv(""), UrlComponents::none());
    }

    #[test]
    fn test_default_keeps_protocol_and_domain() {
        assert_eq!(
            normalize_url(FULL, &UrlComponents::default()).as_deref(),
            Some("https://example.com/")
        );
    }

    #[test]
    fn test_all_components_in_order() {
        assert_eq!(
            normalize_url(FULL, &UrlComponents::all()).as_deref(),
            Some("https://example.com/docs/page?lang=en&v=2#intro")
        );
    }

    #[test]
    fn test_single_components() {
        let only = |f: fn(&mut UrlComponents)| {
            let mut c = UrlComponents::none();
            f(&mut c);
            normalize_url(FULL, &c)
        };
        assert_eq!(only(|c| c.protocol = true).as_deref(), Some("https://"));
        assert_eq!(only(|c| c.domain = true).as_deref(), Some("example.com/"));
        assert_eq!(only(|c| c.path = true).as_deref(), Some("docs/page"));
        assert_eq!(only(|c| c.query = true).as_deref(), Some("?lang=en&v=2"));
        assert_eq!(only(|c| c.fragment = true).as_deref(), Some("#intro"));
    }

    #[test]
    fn test_missing_components_are_omitted() {
        let url = "http://example.com/path";
        assert_eq!(
            normalize_url(url, &UrlComponents::all()).as_deref(),
            Some("http://example.com/path")
        );

        let bare = "http://example.com";
        assert_eq!(
            normalize_url(bare, &UrlComponents::all()).as_deref(),
            Some("http://example.com/")
        );

        let fragment_only = "https://example.com/p#top";
        assert_eq!(
            normalize_url(fragment_only, &UrlComponents::all()).as_deref(),
            Some("https://example.com/p#top")
        );
    }

    #[test]
    fn test_unparsable_url_is_none() {
        assert_eq!(normalize_url("not a url", &UrlComponents::all()), None);
        assert_eq!(normalize_url("", &UrlComponents::default()), None);
        assert_eq!(normalize_url("about:blank", &UrlComponents::all()), None);
    }
}
