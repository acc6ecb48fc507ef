pub mod config;
pub mod error;
pub mod server;
pub mod service;
pub mod tls;
pub mod translate;

pub mod proto {
    tonic::include_proto!("pubsub.v1");
}

pub use config::{GatewayConfig, ListenAddress, ListenNetwork, TlsPaths, TransportSecurity};
pub use error::GatewayError;
pub use server::{Listener, bind, run, serve};
pub use service::PubSubGateway;
