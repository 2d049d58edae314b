//! SASL/GSSAPI authentication of a freshly opened connection.
//!
//! The [`Negotiator`] drives a single exchange:
//!
//! 1. `SaslHandshake` asks the broker for its mechanisms. GSSAPI missing
//!    from the answer ends the exchange before any token is sent.
//! 2. `SaslAuthenticate` rounds carry tokens between the broker and the
//!    [`SecurityContext`] until the context is established.
//! 3. One more round settles the RFC 4752 security layer: the broker
//!    offers layers in a wrapped 4 byte message, the client picks "none"
//!    and names its authorization id.
//!
//! Kerberos itself stays outside the crate. Tickets, keytabs and the GSS
//! mechanism are reached through [`SecurityContextProvider`], so the same
//! negotiator runs against a system GSSAPI binding or a scripted test
//! context.
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde_derive::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    error::{Error, KafkaCode, NegotiationError, Result},
    protocol::{
        SaslAuthenticateRequest, SaslAuthenticateResponse, SaslHandshakeRequest,
        SaslHandshakeResponse,
    },
};

pub const GSSAPI: &str = "GSSAPI";
pub const DEFAULT_MAX_ROUNDS: u32 = 5;
pub const DEFAULT_SERVICE_NAME: &str = "kafka";

// RFC 4752 section 3.1
const NO_SECURITY_LAYER: u8 = 0x01;
const LAYER_MESSAGE_LEN: usize = 4;

/// Kerberos identity used to authenticate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KerberosConfig {
    pub principal: String,
    pub keytab: PathBuf,
    /// First component of the broker's service principal.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Identity to act as, when it differs from the principal.
    #[serde(default)]
    pub authorization_id: Option<String>,
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_owned()
}

impl KerberosConfig {
    pub fn new(principal: impl Into<String>, keytab: impl Into<PathBuf>) -> Self {
        Self {
            principal: principal.into(),
            keytab: keytab.into(),
            service_name: default_service_name(),
            authorization_id: None,
        }
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn with_authorization_id(mut self, authorization_id: impl Into<String>) -> Self {
        self.authorization_id = Some(authorization_id.into());
        self
    }

    /// Host based service name, `service@host`.
    pub fn target_name(&self, host: &str) -> String {
        format!("{}@{}", self.service_name, host)
    }
}

/// Output of one [`SecurityContext::step`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextStep {
    /// Token for the broker, if this step produced one.
    pub token: Option<Bytes>,
    /// The context is established.
    pub complete: bool,
}

/// An initiator-side GSS security context for one connection.
pub trait SecurityContext: Send {
    /// Consume the broker's last token (empty on the first call) and
    /// produce the next one.
    fn step(&mut self, input: &[u8]) -> Result<ContextStep>;

    fn wrap_token(&mut self, message: &[u8]) -> Result<Bytes>;

    fn unwrap_token(&mut self, message: &[u8]) -> Result<Bytes>;
}

/// Source of security contexts, normally backed by the system Kerberos
/// libraries and a credential cache filled from the keytab.
pub trait SecurityContextProvider: Send + Sync + Debug {
    /// `false` when this host cannot do GSSAPI at all.
    fn gssapi_available(&self) -> bool {
        true
    }

    fn create(&self, kerberos: &KerberosConfig, host: &str) -> Result<Box<dyn SecurityContext>>;
}

/// Provider used when none is configured. Every negotiation fails with
/// [`NegotiationError::MechanismUnavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGssapi;

impl SecurityContextProvider for NoGssapi {
    fn gssapi_available(&self) -> bool {
        false
    }

    fn create(&self, _: &KerberosConfig, _: &str) -> Result<Box<dyn SecurityContext>> {
        Err(NegotiationError::MechanismUnavailable.into())
    }
}

/// The two SASL requests, as seen by the negotiator.
#[async_trait]
pub trait SaslTransport: Send {
    async fn handshake(&mut self, request: SaslHandshakeRequest) -> Result<SaslHandshakeResponse>;

    async fn authenticate(
        &mut self,
        request: SaslAuthenticateRequest,
    ) -> Result<SaslAuthenticateResponse>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    Start,
    /// Round `n` of the token exchange is in flight, counting from 1.
    TokenExchange(u32),
    Complete,
    Failed,
}

/// Result of a completed negotiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// `SaslAuthenticate` round trips used.
    pub rounds: u32,
    /// Time until the broker expects re-authentication, if it set one.
    pub session_lifetime: Option<Duration>,
}

/// Single use driver of the SASL/GSSAPI exchange for one connection.
#[derive(Debug)]
pub struct Negotiator {
    kerberos: KerberosConfig,
    provider: Arc<dyn SecurityContextProvider>,
    host: String,
    max_rounds: u32,
    state: NegotiationState,
}

impl Negotiator {
    pub fn new(
        kerberos: KerberosConfig,
        provider: Arc<dyn SecurityContextProvider>,
        host: &str,
    ) -> Self {
        Self {
            kerberos,
            provider,
            host: host.to_owned(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            state: NegotiationState::Start,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// Authenticate over `transport`.
    ///
    /// Ends in `Complete` or `Failed`. Either way the negotiator is spent,
    /// and after a failure the connection must be discarded.
    #[instrument(name = "sasl-negotiate", level = "debug", skip_all, fields(host = %self.host))]
    pub async fn run<T: SaslTransport + ?Sized>(&mut self, transport: &mut T) -> Result<Session> {
        if self.state != NegotiationState::Start {
            return Err(NegotiationError::AlreadyRun(self.state.clone()).into());
        }

        match self.exchange(transport).await {
            Ok(session) => {
                tracing::debug!("SASL/GSSAPI complete after {} rounds", session.rounds);
                self.state = NegotiationState::Complete;
                Ok(session)
            }
            Err(err) => {
                tracing::warn!("SASL/GSSAPI failed in {:?}: {}", self.state, err);
                self.state = NegotiationState::Failed;
                Err(err)
            }
        }
    }

    async fn exchange<T: SaslTransport + ?Sized>(&mut self, transport: &mut T) -> Result<Session> {
        if !self.provider.gssapi_available() {
            return Err(NegotiationError::MechanismUnavailable.into());
        }

        let handshake = transport
            .handshake(SaslHandshakeRequest::new(GSSAPI))
            .await?;
        tracing::debug!("Broker offers {:?}", handshake.mechanisms);
        if handshake.error_code == KafkaCode::UnsupportedSaslMechanism
            || !handshake.supports(GSSAPI)
        {
            return Err(NegotiationError::UnsupportedMechanism {
                offered: handshake.mechanisms,
            }
            .into());
        }
        if !handshake.error_code.is_ok() {
            return Err(Error::Broker(handshake.error_code));
        }

        // the context lives only as long as this exchange
        let mut context = self.provider.create(&self.kerberos, &self.host)?;
        let mut input = Bytes::new();
        let mut established = false;
        let mut round = 0;

        loop {
            round += 1;
            if round > self.max_rounds {
                return Err(NegotiationError::Exhausted {
                    rounds: self.max_rounds,
                }
                .into());
            }
            self.state = NegotiationState::TokenExchange(round);

            let finishing = established;
            let token = if established {
                self.security_layer_reply(context.as_mut(), &input)?
            } else {
                let step = context.step(&input)?;
                established = step.complete;
                step.token.unwrap_or_default()
            };

            tracing::trace!("Round {}: sending {} byte token", round, token.len());
            let response = transport
                .authenticate(SaslAuthenticateRequest::new(token))
                .await?;

            if !response.error_code.is_ok() {
                let message = response
                    .error_message
                    .unwrap_or_else(|| format!("{:?}", response.error_code));
                return Err(NegotiationError::AuthenticationFailed(message).into());
            }

            if finishing {
                return Ok(Session {
                    rounds: round,
                    session_lifetime: (response.session_lifetime_ms > 0)
                        .then(|| Duration::from_millis(response.session_lifetime_ms as u64)),
                });
            }
            input = response.auth_bytes;
        }
    }

    fn security_layer_reply(
        &self,
        context: &mut dyn SecurityContext,
        offer: &[u8],
    ) -> Result<Bytes> {
        let offer = context.unwrap_token(offer)?;
        if offer.len() != LAYER_MESSAGE_LEN {
            return Err(NegotiationError::SecurityLayer(format!(
                "offer of {} bytes",
                offer.len()
            ))
            .into());
        }
        if offer[0] & NO_SECURITY_LAYER == 0 {
            return Err(NegotiationError::SecurityLayer(format!(
                "broker requires a protection layer (offered {:#04x})",
                offer[0]
            ))
            .into());
        }

        let authzid = self.kerberos.authorization_id.as_deref().unwrap_or_default();
        let mut reply = BytesMut::with_capacity(LAYER_MESSAGE_LEN + authzid.len());
        // no layer, so no maximum message size
        reply.put_u8(NO_SECURITY_LAYER);
        reply.put_slice(&[0, 0, 0]);
        reply.put_slice(authzid.as_bytes());
        context.wrap_token(&reply)
    }
}
