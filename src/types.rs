#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;

/// Terminal outcomes of a tunnelled request. Every variant ends the request it
/// belongs to; nothing is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("invalid proxy configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("a request is already in progress")]
    AlreadyInProgress,

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("proxy rejected CONNECT: {0}")]
    ProxyRejected(String),

    #[error("target responded {0}")]
    TargetRejected(String),

    #[error("Timeout")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Where the forward proxy lives and how to authenticate against it.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxySettings {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Rejects settings that can never reach a proxy, before any I/O happens.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.host.trim().is_empty() {
            return Err(TunnelError::InvalidConfiguration(
                "proxy host is empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(TunnelError::InvalidConfiguration(format!(
                "proxy port {} is out of range",
                self.port
            )));
        }
        Ok(())
    }

    /// Username and password for Basic auth, if a non-empty username is set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self.username.as_deref() {
            Some(user) if !user.is_empty() => {
                Some((user, self.password.as_deref().unwrap_or("")))
            }
            _ => None,
        }
    }
}

// The password never ends up in logs.
impl fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProxySettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for ProxySettings {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Progress of a single tunnelled request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    ConnectingToProxy,
    ProxyHandshakeWait,
    AwaitingConnectResponse,
    TargetHandshakeWait,
    AwaitingHttpResponse,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let printable = match self {
            Stage::Idle => "idle",
            Stage::ConnectingToProxy => "connecting to proxy",
            Stage::ProxyHandshakeWait => "proxy TLS handshake",
            Stage::AwaitingConnectResponse => "awaiting CONNECT response",
            Stage::TargetHandshakeWait => "target TLS handshake",
            Stage::AwaitingHttpResponse => "awaiting HTTP response",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        write!(f, "{}", printable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_host_is_invalid() {
        let settings = ProxySettings::new("  ", 8080);
        assert!(matches!(
            settings.validate(),
            Err(TunnelError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn zero_port_is_invalid() {
        let settings = ProxySettings::new("proxy.local", 0);
        assert!(matches!(
            settings.validate(),
            Err(TunnelError::InvalidConfiguration(_))
        ));
        assert!(ProxySettings::new("proxy.local", 3128).validate().is_ok());
    }

    #[test]
    fn empty_username_means_no_credentials() {
        let settings = ProxySettings::new("proxy.local", 3128).with_credentials("", "secret");
        assert_eq!(settings.credentials(), None);

        let mut settings = ProxySettings::new("proxy.local", 3128);
        settings.username = Some("alice".to_string());
        assert_eq!(settings.credentials(), Some(("alice", "")));
    }

    #[test]
    fn debug_output_hides_password() {
        let settings = ProxySettings::new("proxy.local", 3128).with_credentials("alice", "hunter2");
        let printed = format!("{:?}", settings);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn timeout_and_cancel_messages_are_stable() {
        assert_eq!(TunnelError::Timeout.to_string(), "Timeout");
        assert_eq!(TunnelError::Cancelled.to_string(), "Cancelled");
    }
}
