//! TCP listener and per-connection session loops.
//!
//! The server owns the bound socket and the accept loop; each accepted
//! connection gets its own task running the read→respond session loop.
//! Stopping cancels the accept loop, notifies the remaining clients, and
//! force-disconnects everything the registry still tracks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ClientHandle;
use crate::config::Config;
use crate::registry::ClientRegistry;
use crate::resolver::HostnameResolver;

/// Capacity of the join/leave event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Listener lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServerState::Starting,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

/// Join/leave notifications published to external subscribers.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientJoined {
        client: Arc<ClientHandle>,
        at: DateTime<Utc>,
    },
    ClientLeft {
        client: Arc<ClientHandle>,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: Config,
    registry: ClientRegistry,
    resolver: Arc<dyn HostnameResolver>,
    state: AtomicU8,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<CancellationToken>>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ServerEvent>,
}

impl Server {
    /// The registry is passed in rather than owned globally so tests and
    /// embedders can run several independent servers.
    pub fn new(
        config: Config,
        registry: ClientRegistry,
        resolver: Arc<dyn HostnameResolver>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ServerInner {
                config,
                registry,
                resolver,
                state: AtomicU8::new(ServerState::Stopped as u8),
                local_addr: Mutex::new(None),
                shutdown: Mutex::new(None),
                accept_task: tokio::sync::Mutex::new(None),
                events,
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.inner.registry
    }

    /// Address the listener actually bound to. None until started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("mutex poisoned")
    }

    /// Subscribe to join/leave events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Bind the listener and launch the accept loop. Returns as soon as the
    /// loop is running; calling start on a server that is not stopped is a
    /// logged no-op.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self
            .inner
            .state
            .compare_exchange(
                ServerState::Stopped as u8,
                ServerState::Starting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            info!("server is already running");
            return Ok(());
        }

        info!(address = %self.inner.config.listen, "starting listener");
        let listener = match TcpListener::bind(self.inner.config.listen).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner
                    .state
                    .store(ServerState::Stopped as u8, Ordering::SeqCst);
                return Err(ServerError::Bind {
                    addr: self.inner.config.listen,
                    source: e,
                });
            }
        };

        *self.inner.local_addr.lock().expect("mutex poisoned") = listener.local_addr().ok();

        let token = CancellationToken::new();
        *self.inner.shutdown.lock().expect("mutex poisoned") = Some(token.clone());

        self.inner
            .state
            .store(ServerState::Running as u8, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(accept_loop(inner, listener, token));
        *self.inner.accept_task.lock().await = Some(task);

        Ok(())
    }

    /// Stop accepting, notify the remaining clients, and disconnect them.
    /// A no-op unless the server is currently running.
    pub async fn stop(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                ServerState::Running as u8,
                ServerState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!("stop requested but server is not running");
            return;
        }

        info!("stopping listener");

        if let Some(token) = self.inner.shutdown.lock().expect("mutex poisoned").take() {
            token.cancel();
        }
        if let Some(task) = self.inner.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "accept loop task failed");
            }
        }

        // Clients that still look alive get the shutdown notice; ones the
        // poll already marked dead are force-disconnected by the write gate.
        self.inner
            .registry
            .broadcast(&self.inner.config.shutdown_notice)
            .await;
        for client in self.inner.registry.snapshot() {
            client.disconnect();
        }

        self.inner
            .state
            .store(ServerState::Stopped as u8, Ordering::SeqCst);
        info!("server stopped");
    }
}

impl ServerInner {
    fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ServerState::Running as u8
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("listener closed, leaving accept loop");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                if !inner.is_running() {
                    // Raced with stop(): refuse the connection outright.
                    debug!(peer = %addr, "discarding connection accepted during shutdown");
                    drop(stream);
                    continue;
                }
                debug!(peer = %addr, "new connection");
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    admit_client(inner, stream).await;
                });
            }
            Err(e) => {
                if inner.is_running() {
                    error!(error = %e, "failed to accept connection");
                } else {
                    info!("listener stopped, ignoring accept error");
                    break;
                }
            }
        }
    }
}

/// Resolve, wrap, register, and announce one accepted connection, then run
/// its session loop to completion.
async fn admit_client(inner: Arc<ServerInner>, stream: TcpStream) {
    let host = match stream.peer_addr() {
        Ok(addr) if inner.config.resolve_hostnames => {
            let resolver = Arc::clone(&inner.resolver);
            let ip = addr.ip();
            match tokio::task::spawn_blocking(move || resolver.resolve(ip)).await {
                Ok(Ok(name)) => Some(name),
                Ok(Err(e)) => {
                    // Lookup failure is not grounds for dropping the client.
                    debug!(peer = %addr, error = %e, "reverse lookup failed, using address");
                    None
                }
                Err(e) => {
                    warn!(peer = %addr, error = %e, "reverse lookup task failed");
                    None
                }
            }
        }
        _ => None,
    };

    let client = match ClientHandle::new(stream, host) {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "failed to set up accepted connection");
            return;
        }
    };

    if !inner.registry.register(&client) {
        warn!(client = %client, "client could not be registered, dropping");
        client.disconnect();
        return;
    }

    info!(client = %client, peer = %client.addr(), "client joined");
    let _ = inner.events.send(ServerEvent::ClientJoined {
        client: Arc::clone(&client),
        at: Utc::now(),
    });

    run_session(inner, client).await;
}

/// Per-connection read→respond loop. Runs until the server stops, the peer
/// goes away, or an I/O failure ends the session. The trailing disconnect is
/// unconditional; it is a no-op when the handle already tore down.
async fn run_session(inner: Arc<ServerInner>, client: Arc<ClientHandle>) {
    while inner.is_running() && client.is_connected() {
        match client.read_line().await {
            Ok(Some(line)) => {
                debug!(client = %client, line = %line, "received line");
                if let Err(e) = client.write_line(&respond(&line)).await {
                    warn!(client = %client, error = %e, "response delivery failed");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                if inner.is_running() {
                    warn!(client = %client, error = %e, "session read failed");
                } else {
                    info!(client = %client, "session ended by server shutdown");
                }
                break;
            }
        }
    }

    client.disconnect();
    info!(client = %client, "client disconnected");
    let _ = inner.events.send(ServerEvent::ClientLeft {
        client,
        at: Utc::now(),
    });
}

/// Response line for one received line.
fn respond(line: &str) -> String {
    format!("Response received: {line}")
}
