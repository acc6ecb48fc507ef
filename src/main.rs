use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use gateway::{GatewayConfig, ListenAddress, ListenNetwork, TlsPaths, TransportSecurity};
use metrics::server::{MetricsServerConfig, run_metrics_server};
use metrics::{Metrics, SharedMetrics};
use networking::gossipsub::config::GossipsubConfig;
use networking::network::{NetworkService, NetworkServiceConfig};
use networking::{MemoryPubSub, PubSub};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(about = "gRPC gateway to a libp2p gossipsub overlay")]
struct Args {
    /// Overlay QUIC listen address
    #[arg(short, long, default_value = "0.0.0.0")]
    address: IpAddr,

    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Multiaddr, or YAML file listing multiaddrs
    #[arg(short, long)]
    bootnodes: Vec<String>,

    /// Topics joined at startup and kept for the lifetime of the process
    #[arg(short, long)]
    topics: Vec<String>,

    /// One of tcp, tcp4, tcp6, unix
    #[arg(long, default_value = "tcp")]
    grpc_network: ListenNetwork,

    /// host:port for tcp networks, socket path for unix
    #[arg(long, default_value = "127.0.0.1:9090")]
    grpc_address: String,

    /// Serve gRPC without TLS
    #[arg(long, conflicts_with_all = ["tls_cert", "tls_key", "tls_client_ca"])]
    insecure: bool,

    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Require client certificates signed by this CA
    #[arg(long, requires = "tls_cert")]
    tls_client_ca: Option<PathBuf>,

    /// Serve an in-process overlay instead of joining the network
    #[arg(long)]
    loopback: bool,

    #[arg(long)]
    metrics: bool,

    #[arg(long, default_value = "127.0.0.1")]
    metrics_address: IpAddr,

    #[arg(long, default_value_t = 5054)]
    metrics_port: u16,
}

impl Args {
    fn transport_security(&self) -> Result<TransportSecurity> {
        if self.insecure {
            return Ok(TransportSecurity::Insecure);
        }

        let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) else {
            bail!("either --insecure or --tls-cert with --tls-key is required");
        };

        Ok(TransportSecurity::Tls(TlsPaths {
            cert: cert.clone(),
            key: key.clone(),
            client_ca: self.tls_client_ca.clone(),
        }))
    }

    fn gateway_config(&self) -> Result<GatewayConfig> {
        Ok(GatewayConfig::new(
            ListenAddress::new(self.grpc_network, self.grpc_address.clone()),
            self.transport_security()?,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let gateway_config = args.gateway_config()?;
    let metrics: SharedMetrics = Arc::new(Metrics::new()?);
    let shutdown = CancellationToken::new();

    task::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    shutdown.cancel();
                }
                Err(err) => warn!(%err, "Failed to listen for Ctrl-C"),
            }
        }
    });

    let mut background = Vec::new();

    let pubsub: Arc<dyn PubSub> = if args.loopback {
        let overlay = MemoryPubSub::new();
        for topic in &args.topics {
            overlay.join(topic);
        }
        info!(peer = %overlay.local_peer_id(), "Using in-process overlay");
        Arc::new(overlay)
    } else {
        let mut gossipsub_config = GossipsubConfig::new()?;
        gossipsub_config.set_topics(args.topics.clone());

        let network_service_config = Arc::new(NetworkServiceConfig::new(
            gossipsub_config,
            args.address,
            args.port,
            args.bootnodes.clone(),
        ));
        let (mut network_service, handle) = NetworkService::new(network_service_config).await?;
        info!(peer = %handle.local_peer_id(), "Pubsub overlay started");

        let token = shutdown.clone();
        background.push(task::spawn(async move {
            if let Err(err) = network_service.start(token.clone()).await {
                error!(%err, "Pubsub overlay exited with error");
                token.cancel();
            }
        }));

        Arc::new(handle)
    };

    if args.metrics {
        let config = MetricsServerConfig {
            metrics_address: args.metrics_address,
            metrics_port: args.metrics_port,
        };
        let metrics = metrics.clone();
        let token = shutdown.clone();
        background.push(task::spawn(async move {
            let signal = token.clone();
            let stopped = async move { signal.cancelled().await };
            if let Err(err) = run_metrics_server(config, metrics, stopped).await {
                error!(%err, "Metrics server exited with error");
            }
        }));
    }

    let result = gateway::run(&gateway_config, pubsub, metrics, shutdown.clone()).await;

    shutdown.cancel();
    for handle in background {
        if let Err(err) = handle.await {
            warn!(%err, "Background task panicked");
        }
    }

    result?;
    info!("Gateway exited");
    Ok(())
}
