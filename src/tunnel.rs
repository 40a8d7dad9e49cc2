use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::render::render_response;
use crate::request::{build_connect, build_get, redact_for_trace};
use crate::response::{parse_connect_response, parse_http_response, HttpResponse, Parsed};
use crate::target::TargetDescriptor;
use crate::transport::{SessionId, Transport, TransportEnvelope, TransportEvent};
use crate::trust::TrustConfig;
use crate::types::{ProxySettings, Stage, TunnelError};

/// One window for the whole sequence, from `start` to the final response byte.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Most bytes buffered for one response before the request is failed.
pub const MAX_RESPONSE_BYTES: usize = 32 * 1024 * 1024;

/// Outcome of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub response: HttpResponse,
    /// Status, headers and body prepared for display.
    pub rendered: String,
}

/// Lifecycle notifications for whoever drives the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Started,
    DebugTrace(String),
    SecurityWarning(String),
    /// Emitted exactly once per accepted `start`.
    Finished(Result<FetchReport, TunnelError>),
}

struct RequestContext {
    proxy: ProxySettings,
    trust: TrustConfig,
    target: TargetDescriptor,
    session: SessionId,
    buffer: BytesMut,
    started_at: Instant,
    deadline: Instant,
}

/// Drives one CONNECT tunnel at a time through the stages of [`Stage`].
///
/// The client never blocks. It reacts to transport events handed to
/// [`TunnelClient::handle_transport_event`] and to the deadline reported by
/// [`TunnelClient::deadline`], and it reports through the [`ClientEvent`] channel.
pub struct TunnelClient<T: Transport> {
    transport: T,
    proxy: ProxySettings,
    trust: TrustConfig,
    deadline_window: Duration,
    events: UnboundedSender<ClientEvent>,
    in_progress: Arc<AtomicBool>,
    stage: Stage,
    request: Option<RequestContext>,
}

impl<T: Transport> TunnelClient<T> {
    pub fn new(
        transport: T,
        proxy: ProxySettings,
        trust: TrustConfig,
        events: UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            transport,
            proxy,
            trust,
            deadline_window: DEFAULT_DEADLINE,
            events,
            in_progress: Arc::new(AtomicBool::new(false)),
            stage: Stage::Idle,
            request: None,
        }
    }

    pub fn with_deadline(mut self, window: Duration) -> Self {
        self.deadline_window = window;
        self
    }

    pub fn set_proxy_settings(&mut self, proxy: ProxySettings) {
        self.proxy = proxy;
    }

    pub fn set_trust_config(&mut self, trust: TrustConfig) {
        self.trust = trust;
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_in_progress(&self) -> bool {
        self.request.is_some()
    }

    /// Shared view of [`TunnelClient::is_in_progress`] for other tasks.
    pub fn in_progress_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.in_progress)
    }

    /// When the running request times out, if one is running.
    pub fn deadline(&self) -> Option<Instant> {
        self.request.as_ref().map(|ctx| ctx.deadline)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Accepts a new request for `url`, or says synchronously why not.
    ///
    /// Nothing touches the network unless this returns `Ok`.
    pub fn start(&mut self, url: &str) -> Result<(), TunnelError> {
        if self.request.is_some() {
            return Err(TunnelError::AlreadyInProgress);
        }
        self.proxy.validate()?;
        let target = TargetDescriptor::parse(url)?;
        let proxy_layer = self
            .trust
            .proxy_layer()
            .map_err(|e| TunnelError::InvalidConfiguration(e.to_string()))?;

        let now = Instant::now();
        self.request = Some(RequestContext {
            proxy: self.proxy.clone(),
            trust: self.trust.clone(),
            target,
            session: 0,
            buffer: BytesMut::new(),
            started_at: now,
            deadline: now + self.deadline_window,
        });
        self.in_progress.store(true, Ordering::SeqCst);
        self.emit(ClientEvent::Started);
        info!("fetching {} via {}", url, self.proxy);
        self.trace(format!("request for {} via proxy {}", url, self.proxy));
        self.enter(Stage::ConnectingToProxy);

        let session = self
            .transport
            .connect(&self.proxy.host, self.proxy.port, proxy_layer);
        if let Some(ctx) = self.request.as_mut() {
            ctx.session = session;
        }
        Ok(())
    }

    /// Abandons the running request. A no-op when nothing is running.
    pub fn cancel(&mut self) {
        if self.request.is_none() {
            return;
        }
        self.trace("cancelled".to_string());
        self.transport.close();
        self.request = None;
        self.stage = Stage::Idle;
        self.in_progress.store(false, Ordering::SeqCst);
        self.emit(ClientEvent::Finished(Err(TunnelError::Cancelled)));
    }

    /// Fails the running request if `now` is past its deadline.
    pub fn on_deadline(&mut self, now: Instant) {
        let expired = matches!(&self.request, Some(ctx) if now >= ctx.deadline);
        if expired {
            self.trace(format!("deadline reached during {}", self.stage));
            self.finish(Err(TunnelError::Timeout));
        }
    }

    pub fn handle_transport_event(&mut self, envelope: TransportEnvelope) {
        let current = match &self.request {
            Some(ctx) => ctx.session,
            None => {
                trace!("no request running, dropping {:?}", envelope.event);
                return;
            }
        };
        if envelope.session != current {
            trace!(
                "dropping {:?} of stale session {} (current {})",
                envelope.event,
                envelope.session,
                current
            );
            return;
        }

        match (self.stage, envelope.event) {
            (_, TransportEvent::SecurityWarning(message)) => {
                self.trace(format!("security warning: {}", message));
                self.emit(ClientEvent::SecurityWarning(message));
            }
            (_, TransportEvent::Error(message)) => {
                self.trace(format!("transport error: {}", message));
                self.finish(Err(TunnelError::TransportFailure(message)));
            }
            (Stage::ConnectingToProxy, TransportEvent::Connected) => {
                self.trace("TCP connection to proxy established".to_string());
                self.enter(Stage::ProxyHandshakeWait);
            }
            (Stage::ConnectingToProxy | Stage::ProxyHandshakeWait, TransportEvent::SecureEstablished) => {
                self.trace("TLS with proxy established".to_string());
                self.send_connect();
            }
            (Stage::AwaitingConnectResponse, TransportEvent::DataReceived(data)) => {
                self.append(&data);
                self.try_connect_response();
            }
            (Stage::TargetHandshakeWait, TransportEvent::SecureEstablished) => {
                self.trace("TLS with target established inside the tunnel".to_string());
                self.send_get();
            }
            (Stage::AwaitingHttpResponse, TransportEvent::DataReceived(data)) => {
                self.append(&data);
                self.try_http_response(false);
            }
            (Stage::AwaitingHttpResponse, TransportEvent::Closed) => {
                self.trace("target closed the connection".to_string());
                self.try_http_response(true);
            }
            (stage, TransportEvent::Closed) => {
                self.trace(format!("connection closed during {}", stage));
                self.finish(Err(TunnelError::TransportFailure(format!(
                    "connection closed during {}",
                    stage
                ))));
            }
            (stage, event) => {
                debug!("ignoring {:?} during {}", event, stage);
            }
        }
    }

    fn send_connect(&mut self) {
        let Some(ctx) = self.request.as_ref() else {
            return;
        };
        let connect = build_connect(&ctx.target, &ctx.proxy);
        self.trace_request(&connect);
        if self.send(connect, "CONNECT") {
            self.enter(Stage::AwaitingConnectResponse);
        }
    }

    fn send_get(&mut self) {
        let Some(ctx) = self.request.as_ref() else {
            return;
        };
        let get = build_get(&ctx.target);
        self.trace_request(&get);
        if self.send(get, "GET") {
            self.enter(Stage::AwaitingHttpResponse);
        }
    }

    fn send(&mut self, data: Bytes, what: &str) -> bool {
        let len = data.len();
        let written = self.transport.send(data);
        if written < len {
            self.finish(Err(TunnelError::TransportFailure(format!(
                "{} request not accepted ({} of {} bytes)",
                what, written, len
            ))));
            return false;
        }
        true
    }

    fn append(&mut self, data: &[u8]) {
        let Some(ctx) = self.request.as_mut() else {
            return;
        };
        if ctx.buffer.len() + data.len() > MAX_RESPONSE_BYTES {
            self.finish(Err(TunnelError::MalformedResponse(format!(
                "response exceeds {} bytes",
                MAX_RESPONSE_BYTES
            ))));
            return;
        }
        ctx.buffer.extend_from_slice(data);
        self.trace(format!("received {} bytes", data.len()));
    }

    fn try_connect_response(&mut self) {
        let Some(ctx) = self.request.as_mut() else {
            return;
        };
        match parse_connect_response(&mut ctx.buffer) {
            Parsed::Incomplete => {}
            Parsed::Complete(reply) => {
                // whatever follows the head is already the target's handshake
                let preface = ctx.buffer.split().freeze();
                let peer_name = ctx.target.host.clone();
                let target_layer = ctx.trust.target_layer();
                self.trace(format!("< {}", reply.status_line()));
                let target_layer = match target_layer {
                    Ok(layer) => layer,
                    Err(e) => {
                        self.finish(Err(TunnelError::InvalidConfiguration(e.to_string())));
                        return;
                    }
                };
                self.trace(format!(
                    "tunnel open, starting TLS with {} ({} bytes carried over)",
                    peer_name,
                    preface.len()
                ));
                self.enter(Stage::TargetHandshakeWait);
                self.transport
                    .start_upgrade(&peer_name, target_layer, preface);
            }
            Parsed::Rejected(detail) => {
                self.trace(format!("< {}", detail));
                self.finish(Err(TunnelError::ProxyRejected(detail)));
            }
            Parsed::Malformed(detail) => {
                self.finish(Err(TunnelError::MalformedResponse(detail)));
            }
        }
    }

    fn try_http_response(&mut self, eof: bool) {
        let Some(ctx) = self.request.as_mut() else {
            return;
        };
        match parse_http_response(&mut ctx.buffer, eof) {
            Parsed::Incomplete if eof => self.finish(Err(TunnelError::MalformedResponse(
                "response ended prematurely".to_string(),
            ))),
            Parsed::Incomplete => {}
            Parsed::Complete(response) => {
                self.trace(format!(
                    "< {} ({} headers, {} body bytes)",
                    response.status_line(),
                    response.headers.len(),
                    response.body.len()
                ));
                let rendered = render_response(&response);
                self.finish(Ok(FetchReport { response, rendered }));
            }
            Parsed::Rejected(detail) => {
                self.trace(format!("< {}", detail));
                self.finish(Err(TunnelError::TargetRejected(detail)));
            }
            Parsed::Malformed(detail) => {
                self.finish(Err(TunnelError::MalformedResponse(detail)));
            }
        }
    }

    /// Ends the running request; later calls find nothing to end.
    fn finish(&mut self, result: Result<FetchReport, TunnelError>) {
        if self.request.is_none() {
            return;
        }
        let next = if result.is_ok() { Stage::Done } else { Stage::Failed };
        self.enter(next);
        match &result {
            Ok(report) => self.trace(format!(
                "finished: {}",
                report.response.status_line().trim_end()
            )),
            Err(e) => self.trace(format!("failed: {}", e)),
        }
        self.transport.close();
        self.request = None;
        self.in_progress.store(false, Ordering::SeqCst);
        self.emit(ClientEvent::Finished(result));
    }

    fn enter(&mut self, stage: Stage) {
        if self.stage != stage {
            let line = format!("stage {} -> {}", self.stage, stage);
            self.stage = stage;
            self.trace(line);
        }
    }

    fn trace_request(&mut self, request: &[u8]) {
        for line in redact_for_trace(request).lines() {
            self.trace(format!("> {}", line));
        }
    }

    fn trace(&mut self, line: String) {
        let Some(ctx) = self.request.as_mut() else {
            return;
        };
        let stamped = format!(
            "[{:>8.3}s] {}",
            ctx.started_at.elapsed().as_secs_f64(),
            line
        );
        debug!("{}", stamped);
        self.emit(ClientEvent::DebugTrace(stamped));
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}
