use bytes::Bytes;

use crate::trust::LayerTrust;

/// Identifies one connection attempt; events of a superseded session are stale.
pub type SessionId = u64;

/// What a transport reports back to the tunnel state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// TCP connection to the proxy is up.
    Connected,
    /// The most recently requested TLS layer finished its handshake.
    SecureEstablished,
    /// Plaintext of the innermost TLS layer.
    DataReceived(Bytes),
    /// The peer closed the innermost layer.
    Closed,
    Error(String),
    /// A certificate problem that was tolerated.
    SecurityWarning(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEnvelope {
    pub session: SessionId,
    pub event: TransportEvent,
}

impl TransportEnvelope {
    pub fn new(session: SessionId, event: TransportEvent) -> Self {
        Self { session, event }
    }
}

/// Byte pipe that can stack a second TLS session on top of the first one.
///
/// Every call is non-blocking; progress is reported asynchronously as
/// [`TransportEnvelope`]s tagged with the session returned by `connect`.
pub trait Transport: Send {
    /// Opens TCP to `host:port` and starts the outer TLS handshake.
    /// Any previous session is dropped.
    fn connect(&mut self, host: &str, port: u16, trust: LayerTrust) -> SessionId;

    /// Starts a TLS handshake with `peer_name` inside the current secure channel.
    /// `preface` holds bytes already read from the outer layer that belong to
    /// the new one.
    fn start_upgrade(&mut self, peer_name: &str, trust: LayerTrust, preface: Bytes);

    /// Queues plaintext for the innermost layer and returns the accepted length.
    fn send(&mut self, data: Bytes) -> usize;

    /// Tears down every layer. Idempotent.
    fn close(&mut self);
}
