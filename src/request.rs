use base64::engine::general_purpose;
use base64::Engine as _;
use bytes::Bytes;

use crate::target::TargetDescriptor;
use crate::types::ProxySettings;

pub const USER_AGENT: &str = concat!("kitty_tunnel/", env!("CARGO_PKG_VERSION"));

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";

/// `base64(user ":" pass)`, the token of a Basic credential.
pub fn basic_token(username: &str, password: &str) -> String {
    general_purpose::STANDARD.encode(format!("{}:{}", username, password))
}

/// Renders the CONNECT request sent inside the proxy TLS session.
pub fn build_connect(target: &TargetDescriptor, proxy: &ProxySettings) -> Bytes {
    let authority = target.authority();
    let mut req = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);
    if let Some((username, password)) = proxy.credentials() {
        req.push_str(&format!(
            "{}: Basic {}\r\n",
            PROXY_AUTHORIZATION,
            basic_token(username, password)
        ));
    }
    req.push_str(&format!(
        "User-Agent: {}\r\nConnection: keep-alive\r\n\r\n",
        USER_AGENT
    ));
    Bytes::from(req)
}

/// Renders the single-shot GET sent inside the target TLS session.
pub fn build_get(target: &TargetDescriptor) -> Bytes {
    let path = if target.path.is_empty() { "/" } else { target.path.as_str() };
    Bytes::from(format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {}\r\n\
         Accept: {}\r\n\
         Accept-Language: {}\r\n\
         Connection: close\r\n\
         \r\n",
        path,
        target.host_header(),
        USER_AGENT,
        ACCEPT,
        ACCEPT_LANGUAGE
    ))
}

/// Printable copy of a request head with the proxy credential masked.
pub fn redact_for_trace(request: &[u8]) -> String {
    String::from_utf8_lossy(request)
        .split("\r\n")
        .map(|line| {
            let is_credential = line
                .split_once(':')
                .map(|(name, _)| name.trim().eq_ignore_ascii_case(PROXY_AUTHORIZATION))
                .unwrap_or(false);
            if is_credential {
                format!("{}: Basic <redacted>", PROXY_AUTHORIZATION)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> TargetDescriptor {
        TargetDescriptor::parse(url).unwrap()
    }

    #[test]
    fn connect_without_credentials() {
        let req = build_connect(&target("https://example.com/"), &ProxySettings::new("proxy", 8443));
        let expected = format!(
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nUser-Agent: {}\r\nConnection: keep-alive\r\n\r\n",
            USER_AGENT
        );
        assert_eq!(&req[..], expected.as_bytes());
    }

    #[test]
    fn connect_with_basic_auth() {
        let proxy = ProxySettings::new("proxy", 8443).with_credentials("user", "pass");
        let req = build_connect(&target("https://example.com:8443/"), &proxy);
        let text = std::str::from_utf8(&req).unwrap();
        assert!(text.starts_with("CONNECT example.com:8443 HTTP/1.1\r\n"));
        assert!(text.contains("\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn every_line_is_crlf_terminated() {
        let proxy = ProxySettings::new("proxy", 8443).with_credentials("user", "pass");
        for req in [
            build_connect(&target("https://example.com/"), &proxy),
            build_get(&target("https://example.com/a?b=c")),
        ] {
            let bare_lf = req
                .iter()
                .enumerate()
                .any(|(i, &b)| b == b'\n' && (i == 0 || req[i - 1] != b'\r'));
            assert!(!bare_lf);
        }
    }

    #[test]
    fn get_request_shape() {
        let req = build_get(&target("https://example.com/a?b=c"));
        let text = std::str::from_utf8(&req).unwrap();
        assert!(text.starts_with("GET /a?b=c HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(text.contains("\r\nAccept-Language: en-US,en;q=0.9\r\n"));
        assert!(text.contains("\r\nConnection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn get_defaults_to_root_path() {
        let mut t = target("https://example.com");
        t.path.clear();
        let req = build_get(&t);
        assert!(req.starts_with(b"GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn trace_copy_hides_credentials() {
        let proxy = ProxySettings::new("proxy", 8443).with_credentials("user", "pass");
        let req = build_connect(&target("https://example.com/"), &proxy);
        let traced = redact_for_trace(&req);
        assert!(!traced.contains("dXNlcjpwYXNz"));
        assert!(traced.contains("Proxy-Authorization: Basic <redacted>"));
        assert!(traced.starts_with("CONNECT example.com:443 HTTP/1.1"));
    }
}
