use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::tls_transport::TlsTransport;
use crate::transport::{Transport, TransportEnvelope};
use crate::trust::TrustConfig;
use crate::tunnel::{ClientEvent, FetchReport, TunnelClient};
use crate::types::{ProxySettings, TunnelError};

enum Command {
    Start {
        url: String,
        reply: oneshot::Sender<Result<(), TunnelError>>,
    },
    Cancel,
    SetProxySettings(ProxySettings),
    SetTrustConfig(TrustConfig),
}

/// Cloneable remote control for a tunnel task started with [`spawn_tunnel`].
#[derive(Clone)]
pub struct TunnelHandle {
    commands: UnboundedSender<Command>,
    in_progress: Arc<AtomicBool>,
}

fn task_gone() -> TunnelError {
    TunnelError::TransportFailure("tunnel task has stopped".to_string())
}

impl TunnelHandle {
    /// Starts a request; resolves as soon as it is accepted or rejected.
    pub async fn start(&self, url: &str) -> Result<(), TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start {
                url: url.to_string(),
                reply,
            })
            .map_err(|_| task_gone())?;
        rx.await.map_err(|_| task_gone())?
    }

    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    pub fn set_proxy_settings(&self, proxy: ProxySettings) {
        let _ = self.commands.send(Command::SetProxySettings(proxy));
    }

    pub fn set_trust_config(&self, trust: TrustConfig) {
        let _ = self.commands.send(Command::SetTrustConfig(trust));
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }
}

/// Spawns the task that owns a [`TunnelClient`] over a [`TlsTransport`].
///
/// The task stops once every handle is dropped, cancelling whatever is running.
pub fn spawn_tunnel(
    proxy: ProxySettings,
    trust: TrustConfig,
    deadline: Duration,
) -> (TunnelHandle, UnboundedReceiver<ClientEvent>, JoinHandle<()>) {
    let (transport, transport_events) = TlsTransport::new();
    let (events, events_rx) = mpsc::unbounded_channel();
    let client = TunnelClient::new(transport, proxy, trust, events).with_deadline(deadline);
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let handle = TunnelHandle {
        commands,
        in_progress: client.in_progress_flag(),
    };
    let task = tokio::spawn(run(client, commands_rx, transport_events));
    (handle, events_rx, task)
}

async fn run<T: Transport>(
    mut client: TunnelClient<T>,
    mut commands: UnboundedReceiver<Command>,
    mut transport_events: UnboundedReceiver<TransportEnvelope>,
) {
    loop {
        let deadline = client.deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start { url, reply }) => {
                    let _ = reply.send(client.start(&url));
                }
                Some(Command::Cancel) => client.cancel(),
                Some(Command::SetProxySettings(proxy)) => client.set_proxy_settings(proxy),
                Some(Command::SetTrustConfig(trust)) => client.set_trust_config(trust),
                None => {
                    client.cancel();
                    break;
                }
            },
            Some(envelope) = transport_events.recv() => client.handle_transport_event(envelope),
            _ = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => client.on_deadline(Instant::now()),
        }
    }
    debug!("tunnel task stopped");
}

/// Runs one request to completion on a fresh tunnel task.
pub async fn fetch(
    proxy: ProxySettings,
    trust: TrustConfig,
    url: &str,
    deadline: Duration,
) -> Result<FetchReport, TunnelError> {
    let (handle, mut events, task) = spawn_tunnel(proxy, trust, deadline);
    handle.start(url).await?;
    let result = loop {
        match events.recv().await {
            Some(ClientEvent::Finished(result)) => break result,
            Some(_) => continue,
            None => break Err(task_gone()),
        }
    };
    drop(handle);
    let _ = task.await;
    result
}
