use std::fmt;
use std::str::FromStr;

use log::trace;
use url::{Host, Url};

use crate::types::TunnelError;

const DEFAULT_HTTPS_PORT: u16 = 443;

/// The HTTPS resource fetched through the tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub raw_url: String,
    /// Bare host: domain name or IP literal without brackets.
    pub host: String,
    pub port: u16,
    /// Path and query as sent on the request line.
    pub path: String,
}

impl TargetDescriptor {
    pub fn parse(raw: &str) -> Result<Self, TunnelError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TunnelError::InvalidTarget("URL is empty".to_string()));
        }

        // A bare "host/path" is fetched over https.
        let mut candidate = trimmed.to_string();
        if !candidate.contains("://") {
            candidate.insert_str(0, "https://");
        }
        let url = Url::parse(&candidate)
            .map_err(|e| TunnelError::InvalidTarget(format!("{}: {}", trimmed, e)))?;

        if url.scheme() != "https" {
            return Err(TunnelError::InvalidTarget(format!(
                "{}: unsupported scheme {:?}, only https can be tunnelled",
                trimmed,
                url.scheme()
            )));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => {
                return Err(TunnelError::InvalidTarget(format!(
                    "{}: missing host",
                    trimmed
                )))
            }
        };
        let port = url.port().unwrap_or(DEFAULT_HTTPS_PORT);

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        trace!("target {} -> host {} port {} path {}", trimmed, host, port, path);
        Ok(Self {
            raw_url: trimmed.to_string(),
            host,
            port,
            path,
        })
    }

    fn bracketed_host(&self) -> String {
        // RFC3986 wraps IPv6 literals in [ and ]
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `host:port` as used on the CONNECT request line.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.bracketed_host(), self.port)
    }

    /// Value of the `Host` header on the tunnelled GET.
    pub fn host_header(&self) -> String {
        if self.port == DEFAULT_HTTPS_PORT {
            self.bracketed_host()
        } else {
            self.authority()
        }
    }
}

impl FromStr for TargetDescriptor {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "https://{}{}", self.authority(), self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_port_and_path() {
        let target = TargetDescriptor::parse("https://example.com").unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
        assert_eq!(target.path, "/");
        assert_eq!(target.authority(), "example.com:443");
        assert_eq!(target.host_header(), "example.com");
    }

    #[test]
    fn keeps_explicit_port_and_query() {
        let target = TargetDescriptor::parse("https://api.example.com:8443/v1/items?page=2").unwrap();
        assert_eq!(target.port, 8443);
        assert_eq!(target.path, "/v1/items?page=2");
        assert_eq!(target.host_header(), "api.example.com:8443");
    }

    #[test]
    fn bare_host_is_https() {
        let target: TargetDescriptor = "example.org/index.html".parse().unwrap();
        assert_eq!(target.host, "example.org");
        assert_eq!(target.port, 443);
        assert_eq!(target.path, "/index.html");
    }

    #[test]
    fn ipv6_literal_is_bracketed_only_in_authority() {
        let target = TargetDescriptor::parse("https://[::1]:9443/").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.authority(), "[::1]:9443");
    }

    #[test]
    fn rejects_empty_and_hostless_urls() {
        for raw in ["", "   ", "https://", "https://:443/"] {
            assert!(
                matches!(TargetDescriptor::parse(raw), Err(TunnelError::InvalidTarget(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_plain_http() {
        assert!(matches!(
            TargetDescriptor::parse("http://example.com/"),
            Err(TunnelError::InvalidTarget(_))
        ));
    }
}
