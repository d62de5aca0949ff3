//! URL pattern parsing and matching for network intercepts. Patterns are
//! either literal URL strings or structured field sets; both normalize into
//! the same field-by-field comparison, and the fragment never participates.

use url::Url;

use crate::bidi::network::UrlPattern;
use crate::error::{Error, Result};

/// A normalized pattern: absent fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPattern {
    pub protocol: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<String>,
    pub pathname: Option<String>,
    pub search: Option<String>,
}

impl ParsedPattern {
    pub fn parse(pattern: &UrlPattern) -> Result<Self> {
        match pattern {
            UrlPattern::String { pattern } => {
                let url = Url::parse(pattern).map_err(|err| {
                    Error::invalid_argument(format!("invalid URL pattern {pattern:?}: {err}"))
                })?;
                Ok(Self {
                    protocol: Some(url.scheme().to_string()),
                    hostname: Some(url.host_str().unwrap_or("").to_ascii_lowercase()),
                    port: Some(port_of(&url)),
                    pathname: Some(url.path().to_string()),
                    search: Some(url.query().unwrap_or("").to_string()),
                })
            }
            UrlPattern::Pattern {
                protocol,
                hostname,
                port,
                pathname,
                search,
            } => {
                let protocol = protocol
                    .as_deref()
                    .map(normalize_protocol)
                    .transpose()?;
                let hostname = hostname
                    .as_deref()
                    .map(normalize_hostname)
                    .transpose()?;
                let port = port.as_deref().map(normalize_port).transpose()?;
                let pathname = pathname.as_deref().map(|p| {
                    if p.starts_with('/') {
                        p.to_string()
                    } else {
                        format!("/{p}")
                    }
                });
                let search = search
                    .as_deref()
                    .map(|s| s.strip_prefix('?').unwrap_or(s).to_string());
                Ok(Self {
                    protocol,
                    hostname,
                    port,
                    pathname,
                    search,
                })
            }
        }
    }

    /// Field-by-field match against a parsed URL; the fragment is ignored.
    pub fn matches(&self, url: &Url) -> bool {
        if let Some(protocol) = &self.protocol {
            if url.scheme() != protocol {
                return false;
            }
        }
        if let Some(hostname) = &self.hostname {
            if url.host_str().unwrap_or("").to_ascii_lowercase() != *hostname {
                return false;
            }
        }
        if let Some(port) = &self.port {
            if port_of(url) != *port {
                return false;
            }
        }
        if let Some(pathname) = &self.pathname {
            if url.path() != pathname {
                return false;
            }
        }
        if let Some(search) = &self.search {
            if url.query().unwrap_or("") != search {
                return false;
            }
        }
        true
    }

    /// Convenience over a raw URL string; unparsable URLs match nothing.
    pub fn matches_str(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(url) => self.matches(&url),
            Err(_) => false,
        }
    }
}

fn port_of(url: &Url) -> String {
    url.port_or_known_default()
        .map(|p| p.to_string())
        .unwrap_or_default()
}

fn normalize_protocol(raw: &str) -> Result<String> {
    let protocol = raw.strip_suffix(':').unwrap_or(raw).to_ascii_lowercase();
    if protocol.is_empty() || !protocol.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
        return Err(Error::invalid_argument(format!(
            "invalid protocol in URL pattern: {raw:?}"
        )));
    }
    Ok(protocol)
}

fn normalize_hostname(raw: &str) -> Result<String> {
    if raw.is_empty() || raw.contains('/') || raw.contains(':') {
        return Err(Error::invalid_argument(format!(
            "invalid hostname in URL pattern: {raw:?}"
        )));
    }
    Ok(raw.to_ascii_lowercase())
}

fn normalize_port(raw: &str) -> Result<String> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::invalid_argument(format!(
            "invalid port in URL pattern: {raw:?}"
        )));
    }
    Ok(raw.trim_start_matches('0').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_pattern(pattern: &str) -> ParsedPattern {
        ParsedPattern::parse(&UrlPattern::String {
            pattern: pattern.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn literal_pattern_matches_normalized_url() {
        let pattern = string_pattern("http://www.google.com");
        assert!(pattern.matches_str("http://www.google.com/"));
        assert!(pattern.matches_str("http://WWW.GOOGLE.COM/"));
        assert!(!pattern.matches_str("http://www.google.com/search"));
        assert!(!pattern.matches_str("https://www.google.com/"));
    }

    #[test]
    fn structured_pattern_fields_are_wildcards_when_absent() {
        let pattern = ParsedPattern::parse(&UrlPattern::Pattern {
            protocol: Some("https".into()),
            hostname: Some("example.com".into()),
            port: None,
            pathname: None,
            search: None,
        })
        .unwrap();
        assert!(pattern.matches_str("https://example.com/aa"));
        assert!(!pattern.matches_str("https://example.org/aa"));
    }

    #[test]
    fn fragment_is_ignored() {
        let pattern = string_pattern("https://example.com/page");
        assert!(pattern.matches_str("https://example.com/page#section"));
    }

    #[test]
    fn normalization_rules() {
        let pattern = ParsedPattern::parse(&UrlPattern::Pattern {
            protocol: Some("HTTPS:".into()),
            hostname: Some("Example.COM".into()),
            port: Some("0443".into()),
            pathname: Some("path".into()),
            search: Some("?q=1".into()),
        })
        .unwrap();
        assert_eq!(pattern.protocol.as_deref(), Some("https"));
        assert_eq!(pattern.hostname.as_deref(), Some("example.com"));
        assert_eq!(pattern.port.as_deref(), Some("443"));
        assert_eq!(pattern.pathname.as_deref(), Some("/path"));
        assert_eq!(pattern.search.as_deref(), Some("q=1"));
        assert!(pattern.matches_str("https://example.com/path?q=1"));
        assert!(pattern.matches_str("https://example.com:443/path?q=1#top"));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(ParsedPattern::parse(&UrlPattern::String {
            pattern: "not a url".into()
        })
        .is_err());
        assert!(ParsedPattern::parse(&UrlPattern::Pattern {
            protocol: None,
            hostname: Some("exa/mple.com".into()),
            port: None,
            pathname: None,
            search: None,
        })
        .is_err());
        assert!(ParsedPattern::parse(&UrlPattern::Pattern {
            protocol: None,
            hostname: None,
            port: Some("80a".into()),
            pathname: None,
            search: None,
        })
        .is_err());
    }

    #[test]
    fn default_port_matches_explicit_port() {
        let pattern = ParsedPattern::parse(&UrlPattern::Pattern {
            protocol: None,
            hostname: Some("example.com".into()),
            port: Some("443".into()),
            pathname: None,
            search: None,
        })
        .unwrap();
        assert!(pattern.matches_str("https://example.com/"));
        assert!(!pattern.matches_str("https://example.com:8443/"));
    }
}
