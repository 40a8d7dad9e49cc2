use std::cmp;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, Poll};

use anyhow::{anyhow, Context, Result};
use bytes::{Buf, Bytes};
use log::{debug, trace, warn};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::transport::{SessionId, Transport, TransportEnvelope, TransportEvent};
use crate::trust::{LayerTrust, WarningSink};

const READ_BUFFER: usize = 16 * 1024;

/// Anything a TLS layer can run on: a socket or another TLS layer.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

type Layer = TlsStream<Box<dyn TunnelStream>>;

enum Command {
    Send(Bytes),
    Upgrade {
        peer_name: String,
        trust: LayerTrust,
        preface: Bytes,
    },
}

struct ActiveSession {
    id: SessionId,
    commands: UnboundedSender<Command>,
    kill: watch::Sender<bool>,
}

/// tokio + rustls transport. Each `connect` spawns one driver task that owns
/// the socket and every TLS layer stacked on it.
pub struct TlsTransport {
    next_session: SessionId,
    active: Option<ActiveSession>,
    events: UnboundedSender<TransportEnvelope>,
}

impl TlsTransport {
    pub fn new() -> (Self, UnboundedReceiver<TransportEnvelope>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                next_session: 0,
                active: None,
                events,
            },
            rx,
        )
    }
}

impl Transport for TlsTransport {
    fn connect(&mut self, host: &str, port: u16, trust: LayerTrust) -> SessionId {
        self.close();
        self.next_session += 1;
        let id = self.next_session;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (kill, kill_rx) = watch::channel(false);
        let emitter = Emitter {
            session: id,
            events: self.events.clone(),
        };
        tokio::spawn(run_session(
            host.to_string(),
            port,
            trust,
            commands_rx,
            kill_rx,
            emitter,
        ));
        self.active = Some(ActiveSession { id, commands, kill });
        id
    }

    fn start_upgrade(&mut self, peer_name: &str, trust: LayerTrust, preface: Bytes) {
        match &self.active {
            Some(active) => {
                let command = Command::Upgrade {
                    peer_name: peer_name.to_string(),
                    trust,
                    preface,
                };
                if active.commands.send(command).is_err() {
                    warn!("session {} is gone, upgrade to {} dropped", active.id, peer_name);
                }
            }
            None => warn!("upgrade to {} requested without a session", peer_name),
        }
    }

    fn send(&mut self, data: Bytes) -> usize {
        let Some(active) = &self.active else {
            return 0;
        };
        let len = data.len();
        match active.commands.send(Command::Send(data)) {
            Ok(()) => len,
            Err(_) => 0,
        }
    }

    fn close(&mut self) {
        if let Some(active) = self.active.take() {
            debug!("closing session {}", active.id);
            let _ = active.kill.send(true);
        }
    }
}

impl Drop for TlsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone)]
struct Emitter {
    session: SessionId,
    events: UnboundedSender<TransportEnvelope>,
}

impl Emitter {
    fn emit(&self, event: TransportEvent) {
        let _ = self
            .events
            .send(TransportEnvelope::new(self.session, event));
    }

    fn warning_sink(&self) -> WarningSink {
        let emitter = self.clone();
        Arc::new(move |message| emitter.emit(TransportEvent::SecurityWarning(message)))
    }
}

async fn run_session(
    host: String,
    port: u16,
    trust: LayerTrust,
    commands: UnboundedReceiver<Command>,
    mut kill: watch::Receiver<bool>,
    emitter: Emitter,
) {
    let session = emitter.session;
    tokio::select! {
        result = drive(&host, port, trust, commands, &emitter) => {
            if let Err(e) = result {
                debug!("session {} failed: {:#}", session, e);
                emitter.emit(TransportEvent::Error(format!("{:#}", e)));
            }
        }
        _ = async {
            // a dropped sender ends the session just like an explicit kill
            let _ = kill.changed().await;
        } => {
            debug!("session {} stopped", session);
        }
    }
}

async fn drive(
    host: &str,
    port: u16,
    trust: LayerTrust,
    mut commands: UnboundedReceiver<Command>,
    emitter: &Emitter,
) -> Result<()> {
    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("cannot connect to {}:{}", host, port))?;
    tcp.set_nodelay(true)?;
    emitter.emit(TransportEvent::Connected);

    let mut stream = handshake(Box::new(tcp), host, &trust, emitter).await?;
    emitter.emit(TransportEvent::SecureEstablished);

    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(data)) => {
                    trace!("session {} writing {} bytes", emitter.session, data.len());
                    stream.write_all(&data).await.context("write failed")?;
                    stream.flush().await.context("flush failed")?;
                }
                Some(Command::Upgrade { peer_name, trust, preface }) => {
                    debug!(
                        "session {} starting nested TLS with {} ({} buffered bytes)",
                        emitter.session,
                        peer_name,
                        preface.len()
                    );
                    let carrier: Box<dyn TunnelStream> = Box::new(Prepended::new(stream, preface));
                    stream = handshake(carrier, &peer_name, &trust, emitter).await?;
                    emitter.emit(TransportEvent::SecureEstablished);
                }
                None => return Ok(()),
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    emitter.emit(TransportEvent::Closed);
                    return Ok(());
                }
                Ok(n) => emitter.emit(TransportEvent::DataReceived(Bytes::copy_from_slice(&buf[..n]))),
                // peers that skip close_notify still ended the stream
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    emitter.emit(TransportEvent::Closed);
                    return Ok(());
                }
                Err(e) => return Err(anyhow!("read failed: {}", e)),
            }
        }
    }
}

async fn handshake(
    io: Box<dyn TunnelStream>,
    peer_name: &str,
    trust: &LayerTrust,
    emitter: &Emitter,
) -> Result<Layer> {
    let config = trust
        .client_config(peer_name, emitter.warning_sink())
        .with_context(|| format!("cannot prepare TLS for {}", peer_name))?;
    let server_name = ServerName::try_from(peer_name.to_string())
        .with_context(|| format!("{} is not a valid TLS server name", peer_name))?;
    TlsConnector::from(config)
        .connect(server_name, io)
        .await
        .with_context(|| format!("TLS handshake with {} failed", peer_name))
}

/// Replays bytes read ahead from the carrier before reading from it again.
pub(crate) struct Prepended<T> {
    preface: Option<Bytes>,
    inner: T,
}

impl<T> Prepended<T> {
    pub(crate) fn new(inner: T, preface: Bytes) -> Self {
        Self {
            preface: if preface.is_empty() { None } else { Some(preface) },
            inner,
        }
    }
}

impl<T> AsyncRead for Prepended<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut preface) = self.preface.take() {
            let n = cmp::min(preface.len(), buf.remaining());
            buf.put_slice(&preface[..n]);
            preface.advance(n);
            if !preface.is_empty() {
                self.preface = Some(preface);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T> AsyncWrite for Prepended<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
