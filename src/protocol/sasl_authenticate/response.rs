//! Parsing and processing for SaslAuthenticate responses.
//!
//! ### Protocol Def
//! ```text
//! SaslAuthenticate Response (Version: 1) => error_code error_message auth_bytes session_lifetime_ms
//!   error_code => INT16
//!   error_message => NULLABLE_STRING
//!   auth_bytes => BYTES
//!   session_lifetime_ms => INT64
//! ```

use bytes::Bytes;
use nom::{number::complete::be_i64, IResult};
use nombytes::NomBytes;

use crate::{
    error::{Error, KafkaCode, Result},
    parser,
    protocol::parse_body,
};

#[derive(Clone, PartialEq, Eq)]
pub struct SaslAuthenticateResponse {
    pub error_code: KafkaCode,
    pub error_message: Option<String>,
    /// The broker's token for the next round.
    pub auth_bytes: Bytes,
    /// How long the broker will accept this session; zero means no limit.
    pub session_lifetime_ms: i64,
}

impl std::fmt::Debug for SaslAuthenticateResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslAuthenticateResponse")
            .field("error_code", &self.error_code)
            .field("error_message", &self.error_message)
            .field("auth_bytes", &format_args!("<{} bytes>", self.auth_bytes.len()))
            .field("session_lifetime_ms", &self.session_lifetime_ms)
            .finish()
    }
}

impl TryFrom<Bytes> for SaslAuthenticateResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        tracing::trace!("Parsing SaslAuthenticateResponse of {} bytes", s.len());
        let (_, response) = parse_sasl_authenticate_response(NomBytes::new(s)).map_err(|err| {
            tracing::error!("ERROR: Failed parsing SaslAuthenticateResponse {:?}", err);
            Error::Parsing("SaslAuthenticateResponse".to_owned())
        })?;
        Ok(response)
    }
}

pub fn parse_sasl_authenticate_response(
    s: NomBytes,
) -> IResult<NomBytes, SaslAuthenticateResponse> {
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, error_message) = parser::parse_nullable_str(s)?;
    let (s, auth_bytes) = parser::parse_nullable_bytes(s)?;
    let (s, session_lifetime_ms) = be_i64(s)?;
    Ok((
        s,
        SaslAuthenticateResponse {
            error_code,
            error_message,
            auth_bytes: auth_bytes.unwrap_or_default(),
            session_lifetime_ms,
        },
    ))
}
