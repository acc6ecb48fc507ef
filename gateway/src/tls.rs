use std::fs;
use std::path::Path;

use tonic::transport::{Certificate, Identity, ServerTlsConfig};

use crate::config::TlsPaths;
use crate::error::GatewayError;

/// Builds server TLS options from PEM files.
///
/// A configured client CA turns on mutual TLS.
pub fn server_tls_config(paths: &TlsPaths) -> Result<ServerTlsConfig, GatewayError> {
    let cert = read_pem(&paths.cert)?;
    let key = read_pem(&paths.key)?;
    let mut config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

    if let Some(client_ca) = &paths.client_ca {
        config = config.client_ca_root(Certificate::from_pem(read_pem(client_ca)?));
    }

    Ok(config)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, GatewayError> {
    fs::read(path).map_err(|source| GatewayError::Credential {
        path: path.to_path_buf(),
        source,
    })
}
