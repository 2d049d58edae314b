use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, rustls, TlsConnector};
use tracing::instrument;

use crate::{
    config::{BrokerEndpoint, TlsConfig},
    error::{Error, Result},
};

use super::tcp::connect_error;

/// Run the TLS handshake over an established TCP stream.
///
/// Trust roots come from `ca_file` when set, the bundled webpki roots
/// otherwise. A client certificate is presented when both `client_cert`
/// and `client_key` are set.
#[instrument(name = "tls-connect", level = "debug", skip_all, fields(endpoint = %endpoint))]
pub async fn connect_tls(
    stream: TcpStream,
    endpoint: &BrokerEndpoint,
    tls: &TlsConfig,
) -> Result<TlsStream<TcpStream>> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    match &tls.ca_file {
        Some(ca_file) => {
            for cert in load_certs(ca_file)? {
                root_cert_store
                    .add(cert)
                    .map_err(|err| Error::Config(format!("CA file {}: {}", ca_file.display(), err)))?;
            }
        }
        None => root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_cert_store);
    let config = match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|err| Error::Config(format!("client certificate: {}", err)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::Config(
                "client_cert and client_key must be set together".to_owned(),
            ))
        }
    };

    let domain = ServerName::try_from(endpoint.host.clone())
        .map_err(|err| connect_error(endpoint, err))?;

    let connector = TlsConnector::from(Arc::new(config));
    let stream = connector
        .connect(domain, stream)
        .await
        .map_err(|err| {
            tracing::error!("ERROR: TLS handshake with {} {:?}", endpoint, err);
            connect_error(endpoint, err)
        })?;
    tracing::debug!("TLS established with {}", endpoint);
    Ok(stream)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))?
        .ok_or_else(|| Error::Config(format!("{}: no private key found", path.display())))
}
