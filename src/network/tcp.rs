use std::time::Duration;

use tokio::net::TcpStream;
use tracing::instrument;

use crate::{
    config::BrokerEndpoint,
    error::{Error, Result},
};

/// Open a TCP stream to `endpoint`, trying every address the name resolves to.
#[instrument(name = "tcp-connect", level = "debug", skip(timeout), fields(endpoint = %endpoint))]
pub async fn connect_tcp(endpoint: &BrokerEndpoint, timeout: Duration) -> Result<TcpStream> {
    tracing::debug!("Connecting to {}", endpoint);
    let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    let stream = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            tracing::error!("ERROR: Connecting to {} {:?}", endpoint, err);
            return Err(connect_error(endpoint, err));
        }
        Err(_) => {
            tracing::error!("ERROR: Connecting to {} timed out after {:?}", endpoint, timeout);
            return Err(connect_error(
                endpoint,
                format!("timed out after {:?}", timeout),
            ));
        }
    };
    stream
        .set_nodelay(true)
        .map_err(|err| connect_error(endpoint, err))?;
    Ok(stream)
}

pub(crate) fn connect_error(endpoint: &BrokerEndpoint, reason: impl ToString) -> Error {
    Error::Connect {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    }
}
