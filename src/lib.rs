mod config;
mod render;
mod request;
mod response;
mod runner;
mod target;
mod tls_transport;
mod transport;
mod trust;
mod tunnel;
mod types;

pub use config::{ConfigError, ProxySection, Settings, TlsSection};
pub use render::{classify, hex_preview, render_response, BodyKind};
pub use request::{basic_token, build_connect, build_get, USER_AGENT};
pub use response::{parse_connect_response, parse_http_response, ConnectReply, HttpResponse, Parsed};
pub use runner::{fetch, spawn_tunnel, TunnelHandle};
pub use target::TargetDescriptor;
pub use tls_transport::TlsTransport;
pub use transport::{SessionId, Transport, TransportEnvelope, TransportEvent};
pub use trust::{LayerTrust, TrustConfig, TrustError, VerifyMode};
pub use tunnel::{ClientEvent, FetchReport, TunnelClient, DEFAULT_DEADLINE};
pub use types::{ProxySettings, Stage, TunnelError};

