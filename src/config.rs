//! Connection level configuration.
//!
//! Everything a connection needs is passed in explicitly. [`ClientConfig::from_env`]
//! is a convenience for binaries that are configured through `KAFKA_*`
//! variables.
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::{
    codec::DEFAULT_MAX_FRAME_SIZE,
    error::{Error, Result},
    network::sasl::{KerberosConfig, NoGssapi, SecurityContextProvider, DEFAULT_MAX_ROUNDS},
    DEFAULT_CLIENT_ID,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, SecurityProtocol::SaslSsl)
    }
}

impl FromStr for SecurityProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLAINTEXT" => Ok(SecurityProtocol::Plaintext),
            "SASL_PLAINTEXT" => Ok(SecurityProtocol::SaslPlaintext),
            "SASL_SSL" => Ok(SecurityProtocol::SaslSsl),
            other => Err(Error::Config(format!("unknown security protocol {:?}", other))),
        }
    }
}

/// Where a broker listens and how it must be spoken to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16, security_protocol: SecurityProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            security_protocol,
        }
    }

    /// Parse `host:port`.
    pub fn parse(address: &str, security_protocol: SecurityProtocol) -> Result<Self> {
        let address = address.trim();
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("{:?} is not host:port", address)))?;
        if host.is_empty() {
            return Err(Error::Config(format!("{:?} has no host", address)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("{:?} has an invalid port", address)))?;
        Ok(Self::new(host, port, security_protocol))
    }

    /// `host:port`, the key under which connections are pooled.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle of trusted roots. The webpki roots are used without one.
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// Credentials and key material for SASL and TLS listeners.
#[derive(Clone, Debug, Default)]
pub struct SecurityConfig {
    pub kerberos: Option<KerberosConfig>,
    /// Reaches the Kerberos libraries. Without one, GSSAPI is unavailable.
    pub context_provider: Option<Arc<dyn SecurityContextProvider>>,
    pub tls: TlsConfig,
}

impl SecurityConfig {
    pub fn kerberos(
        kerberos: KerberosConfig,
        context_provider: Arc<dyn SecurityContextProvider>,
    ) -> Self {
        Self {
            kerberos: Some(kerberos),
            context_provider: Some(context_provider),
            tls: TlsConfig::default(),
        }
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub(crate) fn provider(&self) -> Arc<dyn SecurityContextProvider> {
        self.context_provider
            .clone()
            .unwrap_or_else(|| Arc::new(NoGssapi))
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub bootstrap: Vec<BrokerEndpoint>,
    pub client_id: String,
    pub security: SecurityConfig,
    pub max_frame_size: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub sasl_max_rounds: u32,
}

impl ClientConfig {
    pub fn new(bootstrap: Vec<BrokerEndpoint>) -> Self {
        Self {
            bootstrap,
            client_id: DEFAULT_CLIENT_ID.to_owned(),
            security: SecurityConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            sasl_max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    /// Parse a comma separated `host:port` list, all under one protocol.
    pub fn from_servers(servers: &str, security_protocol: SecurityProtocol) -> Result<Self> {
        let bootstrap = servers
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| BrokerEndpoint::parse(s, security_protocol))
            .collect::<Result<Vec<_>>>()?;
        if bootstrap.is_empty() {
            return Err(Error::Config("no bootstrap servers".to_owned()));
        }
        Ok(Self::new(bootstrap))
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    /// Set the collaborator that creates GSSAPI security contexts.
    pub fn with_context_provider(mut self, provider: Arc<dyn SecurityContextProvider>) -> Self {
        self.security.context_provider = Some(provider);
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_sasl_max_rounds(mut self, sasl_max_rounds: u32) -> Self {
        self.sasl_max_rounds = sasl_max_rounds;
        self
    }

    /// Read the `KAFKA_*` variables.
    ///
    /// `KAFKA_BOOTSTRAP_SERVERS` is required. SASL protocols also need
    /// `KAFKA_PRINCIPAL` and a `KAFKA_KEYTAB_PATH` that exists. The
    /// Kerberos libraries are not reachable from the environment, so a
    /// [`SecurityContextProvider`] still has to be set on the result.
    pub fn from_env() -> Result<Self> {
        let servers = env_var("KAFKA_BOOTSTRAP_SERVERS")
            .ok_or_else(|| Error::Config("KAFKA_BOOTSTRAP_SERVERS is not set".to_owned()))?;
        let security_protocol = match env_var("KAFKA_SECURITY_PROTOCOL") {
            Some(p) => p.parse()?,
            None => SecurityProtocol::Plaintext,
        };
        let mut config = Self::from_servers(&servers, security_protocol)?;

        if let Some(client_id) = env_var("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }

        if security_protocol.uses_sasl() {
            let principal = env_var("KAFKA_PRINCIPAL").ok_or_else(|| {
                Error::Config(format!("KAFKA_PRINCIPAL is required for {:?}", security_protocol))
            })?;
            let keytab = env_var("KAFKA_KEYTAB_PATH").map(PathBuf::from).ok_or_else(|| {
                Error::Config(format!("KAFKA_KEYTAB_PATH is required for {:?}", security_protocol))
            })?;
            if !keytab.is_file() {
                return Err(Error::Config(format!(
                    "keytab {} does not exist",
                    keytab.display()
                )));
            }
            let mut kerberos = KerberosConfig::new(principal, keytab);
            if let Some(service_name) = env_var("KAFKA_SERVICE_NAME") {
                kerberos.service_name = service_name;
            }
            config.security.kerberos = Some(kerberos);
        }

        config.security.tls.ca_file = env_var("KAFKA_SSL_CAFILE").map(PathBuf::from);

        tracing::debug!(
            "Configured {} bootstrap servers over {:?}",
            config.bootstrap.len(),
            security_protocol
        );
        Ok(config)
    }
}

/// A set, non-blank environment variable.
pub(crate) fn env_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// A set environment variable parsed as `T`, or `default` when unset.
pub(crate) fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env_var(name) {
        Some(v) => v
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value {:?}", name, v))),
        None => Ok(default),
    }
}
