use std::io;
use std::path::PathBuf;

use networking::PubSubError;
use thiserror::Error;
use tonic::Status;

/// Failures that stop the gateway from starting or serving.
///
/// Per-call failures never surface here; they travel to the caller as a
/// [`Status`] built by [`pubsub_status`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid listen address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("unsupported listen network {0:?}")]
    UnsupportedNetwork(String),

    #[error("failed to bind {address}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read credential file {path:?}")]
    Credential {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS configuration")]
    Tls(#[source] tonic::transport::Error),

    #[error("gRPC server failed")]
    Serve(#[source] tonic::transport::Error),
}

impl GatewayError {
    /// The listener could not be created.
    pub fn is_bind_error(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidAddress { .. }
                | GatewayError::UnsupportedNetwork(_)
                | GatewayError::Bind { .. }
        )
    }

    /// Secure transport options could not be built.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, GatewayError::Credential { .. } | GatewayError::Tls(_))
    }
}

/// Maps an overlay failure to the status reported to the RPC caller.
pub fn pubsub_status(err: &PubSubError) -> Status {
    match err {
        PubSubError::InvalidTopic(_) => Status::invalid_argument(err.to_string()),
        PubSubError::ServiceStopped => Status::unavailable(err.to_string()),
        PubSubError::Subscribe { .. }
        | PubSubError::Publish { .. }
        | PubSubError::SubscriptionClosed => Status::internal(err.to_string()),
    }
}
