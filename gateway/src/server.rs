use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::Arc;

use metrics::SharedMetrics;
use networking::PubSub;
use tokio::net::{lookup_host, TcpListener};
#[cfg(unix)]
use tokio::net::UnixListener;
#[cfg(unix)]
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, info};

use crate::config::{GatewayConfig, ListenAddress, ListenNetwork, TransportSecurity};
use crate::error::GatewayError;
use crate::proto::pub_sub_service_server::PubSubServiceServer;
use crate::service::PubSubGateway;
use crate::tls::server_tls_config;

/// A bound, not yet serving, gateway socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, socket: SocketFile },
}

/// Path of a bound unix socket. The file is removed when this is dropped,
/// so every exit from [`serve`] cleans it up.
#[cfg(unix)]
#[derive(Debug)]
pub struct SocketFile(PathBuf);

#[cfg(unix)]
impl SocketFile {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

#[cfg(unix)]
impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            debug!(path = %self.0.display(), %err, "Failed to remove socket file");
        }
    }
}

impl Listener {
    /// Local address of a TCP listener; `None` for unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix { .. } => None,
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => write!(f, "tcp://{addr}"),
                Err(_) => f.write_str("tcp://<unknown>"),
            },
            #[cfg(unix)]
            Listener::Unix { socket, .. } => write!(f, "unix://{}", socket.path().display()),
        }
    }
}

/// Opens the listening socket described by `address`.
pub async fn bind(address: &ListenAddress) -> Result<Listener, GatewayError> {
    match address.network {
        ListenNetwork::Tcp | ListenNetwork::Tcp4 | ListenNetwork::Tcp6 => bind_tcp(address).await,
        ListenNetwork::Unix => bind_unix(address),
    }
}

async fn bind_tcp(address: &ListenAddress) -> Result<Listener, GatewayError> {
    let invalid = |reason: String| GatewayError::InvalidAddress {
        address: address.address.clone(),
        reason,
    };

    let candidates = lookup_host(address.address.as_str())
        .await
        .map_err(|err| invalid(err.to_string()))?;

    let socket_addr = candidates
        .into_iter()
        .find(|addr| match address.network {
            ListenNetwork::Tcp4 => addr.is_ipv4(),
            ListenNetwork::Tcp6 => addr.is_ipv6(),
            _ => true,
        })
        .ok_or_else(|| invalid(format!("no {} address", address.network)))?;

    let listener = TcpListener::bind(socket_addr)
        .await
        .map_err(|source| GatewayError::Bind {
            address: address.to_string(),
            source,
        })?;

    Ok(Listener::Tcp(listener))
}

#[cfg(unix)]
fn bind_unix(address: &ListenAddress) -> Result<Listener, GatewayError> {
    if address.address.is_empty() {
        return Err(GatewayError::InvalidAddress {
            address: address.address.clone(),
            reason: "empty socket path".to_string(),
        });
    }

    let path = PathBuf::from(&address.address);
    let listener = UnixListener::bind(&path).map_err(|source| GatewayError::Bind {
        address: address.to_string(),
        source,
    })?;

    Ok(Listener::Unix {
        listener,
        socket: SocketFile(path),
    })
}

#[cfg(not(unix))]
fn bind_unix(address: &ListenAddress) -> Result<Listener, GatewayError> {
    Err(GatewayError::UnsupportedNetwork(address.network.to_string()))
}

/// Serves the gateway on an already bound `listener` until `shutdown` is
/// cancelled.
///
/// On cancellation new connections are refused, open Subscribe streams
/// are ended with `UNAVAILABLE`, and the call returns `Ok` once in-flight
/// calls have drained. A unix socket file is removed on return, including
/// when TLS setup fails.
pub async fn serve<P>(
    listener: Listener,
    security: &TransportSecurity,
    pubsub: Arc<P>,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
) -> Result<(), GatewayError>
where
    P: PubSub + ?Sized,
{
    let mut builder = Server::builder();
    if let TransportSecurity::Tls(paths) = security {
        builder = builder
            .tls_config(server_tls_config(paths)?)
            .map_err(GatewayError::Tls)?;
    }

    let gateway = PubSubGateway::new(pubsub, metrics, shutdown.clone());
    let router = builder.add_service(PubSubServiceServer::new(gateway));

    info!(address = %listener, %security, "gRPC gateway listening");

    let result = match listener {
        Listener::Tcp(listener) => {
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal(shutdown))
                .await
        }
        #[cfg(unix)]
        Listener::Unix {
            listener,
            socket: _socket,
        } => {
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), signal(shutdown))
                .await
        }
    };

    result.map_err(GatewayError::Serve)?;
    info!("gRPC gateway stopped");
    Ok(())
}

/// Binds `config.listen` and serves until `shutdown` is cancelled.
pub async fn run<P>(
    config: &GatewayConfig,
    pubsub: Arc<P>,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
) -> Result<(), GatewayError>
where
    P: PubSub + ?Sized,
{
    let listener = bind(&config.listen).await?;
    serve(listener, &config.security, pubsub, metrics, shutdown).await
}

fn signal(shutdown: CancellationToken) -> impl Future<Output = ()> {
    async move {
        shutdown.cancelled().await;
        info!("Shutting down gRPC gateway");
    }
}
