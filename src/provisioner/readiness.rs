use std::time::Duration;

use tokio::net::TcpStream;

use super::error::ProvisionError;
use super::types::Endpoint;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// One TCP connect against the control port. The connection is dropped
/// immediately; reaching the port is all that is checked.
pub async fn probe_tcp(endpoint: &Endpoint) -> Result<(), ProvisionError> {
    let addr = endpoint.authority();
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(ProvisionError::Unreachable {
            endpoint: endpoint.clone(),
            message: e.to_string(),
        }),
        Err(_) => Err(ProvisionError::Unreachable {
            endpoint: endpoint.clone(),
            message: format!("connect timed out after {CONNECT_TIMEOUT:?}"),
        }),
    }
}
