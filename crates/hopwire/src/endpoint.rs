//! Endpoint identity and proxy bypass rules.
//!
//! Two endpoints are the same endpoint when scheme, host and port agree;
//! path, query and credentials do not take part in equality.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// URI scheme of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain-text `http`.
    Http,
    /// TLS `https`.
    Https,
}

impl Scheme {
    /// Case-insensitive parse of `http` or `https`.
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("http") {
            Some(Scheme::Http)
        } else if s.eq_ignore_ascii_case("https") {
            Some(Scheme::Https)
        } else {
            None
        }
    }

    /// True for `https`.
    pub fn is_secure(self) -> bool {
        self == Scheme::Https
    }

    /// Lowercase scheme name.
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// The part of an endpoint that decides equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    /// Scheme of the endpoint.
    pub scheme: Scheme,
    /// Lowercased host name or IP literal.
    pub host: String,
    /// Explicit port, or the scheme default.
    pub port: u16,
}

/// An absolute `http`/`https` URI naming a network target.
#[derive(Debug, Clone)]
pub struct Endpoint {
    url: Url,
    key: EndpointKey,
}

impl Endpoint {
    /// Parses an absolute `http`/`https` URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| Error::InvalidEndpoint {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_url(url)
    }

    /// Validates an already-parsed URL.
    pub fn from_url(url: Url) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidEndpoint {
            uri: url.to_string(),
            reason: reason.to_string(),
        };

        let scheme = Scheme::parse(url.scheme()).ok_or_else(|| invalid("unsupported scheme"))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_ascii_lowercase();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;

        Ok(Self {
            key: EndpointKey { scheme, host, port },
            url,
        })
    }

    /// The full URI.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Identity used for equality and hashing.
    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Scheme of the endpoint.
    pub fn scheme(&self) -> Scheme {
        self.key.scheme
    }

    /// Host as used for identity.
    pub fn host(&self) -> &str {
        &self.key.host
    }

    /// Effective port.
    pub fn port(&self) -> u16 {
        self.key.port
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.key.scheme.as_str(), self.key.host, self.key.port)
    }
}

/// Hosts that must be reached directly rather than through a proxy.
///
/// Entries are `*` (everything), an IP literal, an exact host name, or a
/// domain suffix written `.example.com` or `*.example.com`. A bare
/// `example.com` also covers its subdomains.
#[derive(Debug, Clone, Default)]
pub struct BypassList {
    all: bool,
    ips: Vec<IpAddr>,
    domains: Vec<String>,
}

impl BypassList {
    /// Builds a list from config entries; blank entries are ignored.
    pub fn parse<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = BypassList::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry == "*" {
                list.all = true;
                continue;
            }
            let unbracketed = entry.trim_start_matches('[').trim_end_matches(']');
            match unbracketed.parse::<IpAddr>() {
                Ok(ip) => list.ips.push(ip),
                Err(_) => {
                    let domain = entry.trim_start_matches('*').trim_start_matches('.');
                    if !domain.is_empty() {
                        list.domains.push(domain.to_ascii_lowercase());
                    }
                }
            }
        }
        list
    }

    /// True when nothing bypasses the proxies.
    pub fn is_empty(&self) -> bool {
        !self.all && self.ips.is_empty() && self.domains.is_empty()
    }

    /// True if `host` should bypass the proxies.
    pub fn matches(&self, host: &str) -> bool {
        if self.all {
            return true;
        }
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.ips.contains(&ip);
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.domains.iter().any(|domain| {
            host == *domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_path_and_userinfo() {
        let a = Endpoint::parse("http://user:pw@Proxy.Example.com:8080/x").unwrap();
        let b = Endpoint::parse("http://proxy.example.com:8080/").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.host(), "proxy.example.com");
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Endpoint::parse("http://p").unwrap().port(), 80);
        assert_eq!(Endpoint::parse("https://p").unwrap().port(), 443);
        assert_ne!(
            Endpoint::parse("http://p:443").unwrap(),
            Endpoint::parse("https://p").unwrap()
        );
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = Endpoint::parse("ftp://p:21").unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint { .. }));
        assert!(Endpoint::parse("not a uri").is_err());
    }

    #[test]
    fn test_display() {
        let ep = Endpoint::parse("https://Proxy:3128/path").unwrap();
        assert_eq!(ep.to_string(), "https://proxy:3128");
    }

    #[test]
    fn test_bypass_domains() {
        let list = BypassList::parse(["example.com", ".internal", "*.corp.net"]);
        assert!(list.matches("example.com"));
        assert!(list.matches("www.example.com"));
        assert!(!list.matches("badexample.com"));
        assert!(list.matches("db.internal"));
        assert!(list.matches("a.b.corp.net"));
        assert!(list.matches("corp.net"));
        assert!(!list.matches("example.org"));
    }

    #[test]
    fn test_bypass_ips_and_wildcard() {
        let list = BypassList::parse(["10.0.0.1", "[::1]"]);
        assert!(list.matches("10.0.0.1"));
        assert!(list.matches("[::1]"));
        assert!(!list.matches("10.0.0.2"));

        assert!(BypassList::parse(["*"]).matches("anything"));
        assert!(BypassList::parse(Vec::<String>::new()).is_empty());
    }
}
