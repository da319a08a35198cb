//! RTMP TCP Listener and Connection Handling
//!
//! Accepts publish connections (plain or RTMPS), spawns one session task per
//! connection and keeps a handle to each so shutdown can stop and join them.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_native_tls::TlsAcceptor;

use super::registry::StreamRegistry;
use super::session::{IngestSession, SessionError, SessionEvents};
use super::{ConnectionId, HANDSHAKE_TIMEOUT};

/// RTMP server error
#[derive(Debug)]
pub enum ServerError {
    BindError(std::io::Error),
    AcceptError(std::io::Error),
    TlsConfigError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::BindError(e) => write!(f, "Failed to bind RTMP port: {}", e),
            ServerError::AcceptError(e) => write!(f, "Failed to accept connection: {}", e),
            ServerError::TlsConfigError(e) => write!(f, "Failed to load TLS config: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

struct SessionHandle {
    task: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// RTMP listener and the arena of live session tasks
pub struct IngestListener<E> {
    listener: TcpListener,
    events: Arc<E>,
    registry: StreamRegistry,
    tls_acceptor: Option<TlsAcceptor>,
    next_id: u64,
    sessions: HashMap<ConnectionId, SessionHandle>,
}

impl<E: SessionEvents> IngestListener<E> {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        events: Arc<E>,
        registry: StreamRegistry,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(ServerError::BindError)?;

        Ok(IngestListener {
            listener,
            events,
            registry,
            tls_acceptor,
            next_id: 0,
            sessions: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::BindError)
    }

    /// Accept connections until `shutdown` fires, then stop and join every session
    pub async fn run_with_shutdown(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        log::info!(
            "RTMP{} ingest listening on {}",
            if self.tls_acceptor.is_some() { "S" } else { "" },
            addr
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer)) => self.spawn_session(socket, peer).await,
                        Err(e) => {
                            log::error!("{}", ServerError::AcceptError(e));
                        }
                    }
                }
                _ = shutdown.recv() => {
                    log::info!("RTMP server shutting down");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn spawn_session(&mut self, socket: TcpStream, peer: SocketAddr) {
        self.sessions.retain(|_, session| !session.task.is_finished());

        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        log::info!("RTMP connection {} from {}", id, peer);
        if let Err(e) = socket.set_nodelay(true) {
            log::debug!("{}: failed to set TCP_NODELAY: {}", id, e);
        }
        self.registry.add_connecting(id, peer).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let events = self.events.clone();
        let registry = self.registry.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        let task = tokio::spawn(async move {
            // Use a trait object to hold either TcpStream or TlsStream<TcpStream>
            let stream: Box<dyn AsyncStream> = if let Some(tls_acceptor) = tls_acceptor {
                let mut stop = stop_rx.clone();
                match before_session(tls_acceptor.accept(socket), &mut stop).await {
                    Ok(Ok(tls_stream)) => Box::new(tls_stream),
                    Ok(Err(e)) => {
                        log::warn!("{}: TLS handshake failed: {}", id, e);
                        registry.release(id).await;
                        return;
                    }
                    Err(abandoned) => {
                        log::warn!("{}: TLS handshake {}", id, abandoned);
                        registry.release(id).await;
                        return;
                    }
                }
            } else {
                Box::new(socket)
            };

            let session = IngestSession::new(id, stream, events, stop_rx);
            match session.run().await {
                Ok(()) => log::info!("RTMP session {} ended", id),
                Err(e @ (SessionError::Rejected(_) | SessionError::KeyChanged { .. })) => {
                    log::warn!("RTMP session {}: {}", id, e)
                }
                Err(e) => log::error!("RTMP session error from {}: {}", peer, e),
            }
        });

        self.sessions.insert(id, SessionHandle { task, stop: stop_tx });
    }

    async fn shutdown(&mut self) {
        for session in self.sessions.values() {
            let _ = session.stop.send(true);
        }
        for (id, session) in self.sessions.drain() {
            if let Err(e) = session.task.await {
                log::error!("RTMP session {} panicked: {}", id, e);
            }
        }
        self.registry.clear_sessions().await;
        log::info!("RTMP server stopped");
    }
}

/// Why a step ahead of the RTMP session was given up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abandoned {
    TimedOut,
    Stopped,
}

impl std::fmt::Display for Abandoned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Abandoned::TimedOut => write!(f, "timed out"),
            Abandoned::Stopped => write!(f, "interrupted by shutdown"),
        }
    }
}

/// Run `step` under the handshake deadline, giving up early if `stop` fires
async fn before_session<F: Future>(
    step: F,
    stop: &mut watch::Receiver<bool>,
) -> Result<F::Output, Abandoned> {
    if *stop.borrow() {
        return Err(Abandoned::Stopped);
    }
    tokio::select! {
        result = tokio::time::timeout(HANDSHAKE_TIMEOUT, step) => {
            result.map_err(|_| Abandoned::TimedOut)
        }
        _ = stop.changed() => Err(Abandoned::Stopped),
    }
}

/// Build an RTMPS acceptor from PEM certificate and PKCS#8 key files
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, ServerError> {
    let cert = std::fs::read(cert_path)
        .map_err(|e| ServerError::TlsConfigError(format!("{}: {}", cert_path, e)))?;
    let key = std::fs::read(key_path)
        .map_err(|e| ServerError::TlsConfigError(format!("{}: {}", key_path, e)))?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|e| ServerError::TlsConfigError(e.to_string()))?;
    let acceptor = native_tls::TlsAcceptor::new(identity)
        .map_err(|e| ServerError::TlsConfigError(e.to_string()))?;

    Ok(TlsAcceptor::from(acceptor))
}
