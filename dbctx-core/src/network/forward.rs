//! Local TCP port forwarding.
//!
//! Listens on `127.0.0.1` and relays every accepted connection to a remote
//! endpoint. Invalidation tears the listener down together with all relayed
//! connections and rebinds the same local port, so URLs already rewritten
//! for the old listener stay valid.

use super::NetworkHandler;
use crate::Result;
use crate::error::ContextError;
use crate::models::{InvalidatePhase, PhaseOutcome};
use crate::monitor::{ProgressMonitor, cancellable};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Port-forwarding network handler.
pub struct TcpForwardHandler {
    id: String,
    remote_host: String,
    remote_port: u16,
    preferred_port: Option<u16>,
    /// Last bound local port; 0 until first start
    bound_port: AtomicU16,
    active: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for TcpForwardHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpForwardHandler")
            .field("id", &self.id)
            .field("remote", &format!("{}:{}", self.remote_host, self.remote_port))
            .field("local_port", &self.local_port())
            .field("active", &self.is_active())
            .finish()
    }
}

impl TcpForwardHandler {
    /// Creates an inactive forward; `local_port` of `None` picks an ephemeral port.
    pub fn new(
        id: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
        local_port: Option<u16>,
    ) -> Self {
        Self {
            id: id.into(),
            remote_host: remote_host.into(),
            remote_port,
            preferred_port: local_port,
            bound_port: AtomicU16::new(0),
            active: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Local port the forward listens on, once started.
    pub fn local_port(&self) -> Option<u16> {
        match self.bound_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    fn bind(&self, port: u16) -> std::io::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
        socket.listen(128)
    }

    async fn shutdown(&self) {
        let running = self.running.lock().await.take();
        self.active.store(false, Ordering::SeqCst);
        if let Some(running) = running {
            running.shutdown.cancel();
            if let Err(e) = running.task.await {
                tracing::debug!("Forward '{}' accept loop ended abnormally: {}", self.id, e);
            }
            tracing::info!("Stopped TCP forward '{}'", self.id);
        }
    }
}

#[async_trait]
impl NetworkHandler for TcpForwardHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn resolve(&self, mut url: url::Url) -> Result<url::Url> {
        let port = match (self.is_active(), self.local_port()) {
            (true, Some(port)) => port,
            _ => {
                return Err(ContextError::network_handler(
                    &self.id,
                    "forward is not running",
                ));
            }
        };

        url.set_host(Some("127.0.0.1")).map_err(|e| {
            ContextError::network_handler_failed(&self.id, "cannot rewrite URL host", e)
        })?;
        url.set_port(Some(port))
            .map_err(|()| ContextError::network_handler(&self.id, "URL cannot carry a port"))?;
        Ok(url)
    }

    async fn start(&self, monitor: &ProgressMonitor) -> Result<()> {
        let mut running = cancellable(monitor, "network handler start", async {
            Ok(self.running.lock().await)
        })
        .await?;
        if running.is_some() {
            return Ok(());
        }

        let port = self
            .local_port()
            .or(self.preferred_port)
            .unwrap_or(0);
        let listener = self.bind(port).map_err(|e| {
            ContextError::network_handler_failed(
                &self.id,
                format!("failed to listen on 127.0.0.1:{}", port),
                e,
            )
        })?;
        let local = listener.local_addr().map_err(|e| {
            ContextError::network_handler_failed(&self.id, "failed to read local address", e)
        })?;
        self.bound_port.store(local.port(), Ordering::SeqCst);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            self.id.clone(),
            listener,
            self.remote_host.clone(),
            self.remote_port,
            shutdown.clone(),
        ));
        *running = Some(Running { shutdown, task });
        self.active.store(true, Ordering::SeqCst);

        tracing::info!(
            "Started TCP forward '{}' on {} -> {}:{}",
            self.id,
            local,
            self.remote_host,
            self.remote_port
        );
        Ok(())
    }

    async fn invalidate(
        &self,
        phase: InvalidatePhase,
        monitor: &ProgressMonitor,
    ) -> Result<PhaseOutcome> {
        match phase {
            InvalidatePhase::BeforeInvalidate => {
                if !self.is_active() {
                    return Ok(PhaseOutcome::Skipped);
                }
                self.shutdown().await;
                Ok(PhaseOutcome::Completed)
            }
            InvalidatePhase::Invalidate => {
                self.start(monitor).await?;
                Ok(PhaseOutcome::Completed)
            }
            InvalidatePhase::AfterInvalidate => {
                if self.is_active() {
                    Ok(PhaseOutcome::Completed)
                } else {
                    Err(ContextError::network_handler(
                        &self.id,
                        "forward not running after invalidation",
                    ))
                }
            }
        }
    }

    async fn stop(&self) {
        self.shutdown().await;
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

async fn accept_loop(
    id: String,
    listener: TcpListener,
    remote_host: String,
    remote_port: u16,
    shutdown: CancellationToken,
) {
    let mut relays = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    tracing::debug!("Forward '{}' accepted {}", id, peer);
                    relays.spawn(relay(
                        id.clone(),
                        inbound,
                        remote_host.clone(),
                        remote_port,
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Forward '{}' accept failed: {}", id, e);
                }
            },
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }
    }
    drop(listener);
    relays.abort_all();
    while relays.join_next().await.is_some() {}
}

async fn relay(
    id: String,
    mut inbound: TcpStream,
    remote_host: String,
    remote_port: u16,
    shutdown: CancellationToken,
) {
    let mut outbound = match TcpStream::connect((remote_host.as_str(), remote_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(
                "Forward '{}' could not reach {}:{}: {}",
                id,
                remote_host,
                remote_port,
                e
            );
            return;
        }
    };

    tokio::select! {
        () = shutdown.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
            match result {
                Ok((sent, received)) => {
                    tracing::debug!("Forward '{}' relay closed ({} bytes out, {} in)", id, sent, received);
                }
                Err(e) => tracing::debug!("Forward '{}' relay ended: {}", id, e),
            }
        }
    }
}
