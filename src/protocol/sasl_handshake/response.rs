//! Parsing and processing for SaslHandshake responses.
//!
//! ### Protocol Def
//! ```text
//! SaslHandshake Response (Version: 1) => error_code [mechanisms]
//!   error_code => INT16
//!   mechanisms => STRING
//! ```

use bytes::Bytes;
use nom::IResult;
use nombytes::NomBytes;

use crate::{
    error::{Error, KafkaCode, Result},
    parser,
    protocol::parse_body,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslHandshakeResponse {
    pub error_code: KafkaCode,
    /// The mechanisms enabled on the broker's listener.
    pub mechanisms: Vec<String>,
}

impl SaslHandshakeResponse {
    pub fn supports(&self, mechanism: &str) -> bool {
        self.mechanisms.iter().any(|m| m == mechanism)
    }
}

impl TryFrom<Bytes> for SaslHandshakeResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("SaslHandshakeResponse", s, parse_sasl_handshake_response)
    }
}

pub fn parse_sasl_handshake_response(s: NomBytes) -> IResult<NomBytes, SaslHandshakeResponse> {
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, mechanisms) = parser::parse_array(parser::parse_str)(s)?;
    Ok((
        s,
        SaslHandshakeResponse {
            error_code,
            mechanisms,
        },
    ))
}
