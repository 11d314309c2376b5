//! Server lifecycle: bind, accept loop, stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::commitments::CommitmentTable;
use crate::config::ServerConfig;
use crate::correlator::RpcCorrelator;
use crate::dispatch::{self, UnhandledRequest};
use crate::errors::LifecycleError;
use crate::registry::ConnectionRegistry;
use crate::websocket;

/// Shared state behind every accepted connection and request.
pub struct ServerState {
    /// Server configuration.
    pub config: ServerConfig,
    /// Live interceptor connections.
    pub registry: ConnectionRegistry,
    /// The handler table.
    pub commitments: CommitmentTable,
    /// In-flight forwarded requests.
    pub correlator: RpcCorrelator,
    /// Tracks every spawned task so `stop()` can drain them.
    pub(crate) tracker: TaskTracker,
    /// Cancelled when the server stops.
    pub(crate) shutdown: CancellationToken,
    /// When the server was created.
    pub started_at: Instant,
}

pub(crate) type SharedState = Arc<ServerState>;

/// The relay server, ready to bind.
pub struct RelayServer {
    state: SharedState,
}

impl RelayServer {
    /// Create a server from its configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                registry: ConnectionRegistry::new(),
                commitments: CommitmentTable::new(),
                correlator: RpcCorrelator::new(),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                started_at: Instant::now(),
            }),
        }
    }

    /// Bind the listener and start accepting. Port `0` requests an
    /// OS-assigned ephemeral port; the bound address is on the returned
    /// handle. The bind is bounded by the configured start deadline.
    pub async fn listen(self) -> Result<ServerHandle, LifecycleError> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let deadline = self.state.config.start_timeout();

        let listener = match tokio::time::timeout(deadline, TcpListener::bind(&addr)).await {
            Err(_) => return Err(LifecycleError::StartTimeout(deadline)),
            Ok(Err(e)) => return Err(classify_bind_error(e, addr)),
            Ok(Ok(listener)) => listener,
        };
        let local_addr = listener.local_addr()?;

        let accept_state = Arc::clone(&self.state);
        let _ = self.state.tracker.spawn(accept_loop(listener, accept_state));

        tracing::info!(addr = %local_addr, "relay server listening");
        Ok(ServerHandle {
            local_addr,
            state: self.state,
        })
    }
}

/// A running server. Dropping the handle does not stop the server; call
/// [`ServerHandle::stop`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: SharedState,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// The bound address.
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of live interceptor connections.
    pub fn connection_count(&self) -> usize {
        self.state.registry.count()
    }

    /// Number of registered commitments.
    pub fn commitment_count(&self) -> usize {
        self.state.commitments.count()
    }

    /// Number of in-flight forwarded requests.
    pub fn pending_call_count(&self) -> usize {
        self.state.correlator.pending_count()
    }

    /// Stop the server: close every live connection (rejecting their
    /// pending calls and removing their commitments), close the listener,
    /// and drain all tasks inside the stop deadline. Idempotent.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let deadline = self.state.config.stop_timeout();
        tracing::info!("stopping relay server");

        // Connections first, then the listener; both cancellations race
        // but the per-connection teardown owns the cascade either way.
        self.state.registry.close_all();
        self.state.shutdown.cancel();
        self.state.tracker.close();

        if tokio::time::timeout(deadline, self.state.tracker.wait())
            .await
            .is_err()
        {
            return Err(LifecycleError::StopTimeout(deadline));
        }
        tracing::info!("relay server stopped");
        Ok(())
    }
}

fn classify_bind_error(e: std::io::Error, addr: String) -> LifecycleError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => LifecycleError::PortInUse(addr),
        std::io::ErrorKind::AddrNotAvailable | std::io::ErrorKind::InvalidInput => {
            LifecycleError::InvalidAddr(addr)
        }
        _ => LifecycleError::Io(e),
    }
}

/// Accept connections until shutdown; dropping the listener on exit
/// closes the listening socket.
async fn accept_loop(listener: TcpListener, state: SharedState) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "connection accepted");
                    let tracker = state.tracker.clone();
                    let conn_state = Arc::clone(&state);
                    let _ = tracker.spawn(serve_http(stream, conn_state));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            () = state.shutdown.cancelled() => break,
        }
    }
}

/// Serve one TCP connection with hyper.
///
/// The service is fallible on purpose: an [`UnhandledRequest`] error
/// makes hyper drop the connection without writing a response, which is
/// how unhandled mock traffic is reported to its caller.
async fn serve_http(stream: TcpStream, state: SharedState) {
    let io = TokioIo::new(stream);
    let service_state = Arc::clone(&state);
    let service = service_fn(move |req| {
        let state = Arc::clone(&service_state);
        async move { handle_request(state, req).await }
    });

    let conn = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(error = %e, "http connection closed with error");
            }
        }
        () = state.shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = conn.await;
        }
    }
}

/// Route one request: reserved paths first, everything else is mock
/// traffic for the dispatcher.
async fn handle_request(
    state: SharedState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, UnhandledRequest> {
    if req.uri().path() == websocket::WS_PATH {
        return Ok(websocket::handle_upgrade(state, req));
    }
    if req.uri().path() == dispatch::HEALTH_PATH {
        return Ok(dispatch::health(&state));
    }
    dispatch::dispatch(&state, req).await
}
