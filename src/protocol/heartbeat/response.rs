//! Parsing for Heartbeat responses.
//!
//! ### Protocol Def
//! ```text
//! Heartbeat Response (Version: 0) => error_code
//!   error_code => INT16
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
pub struct HeartbeatResponse {
    pub error_code: KafkaCode,
}

impl TryFrom<Bytes> for HeartbeatResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("HeartbeatResponse", s, parse_heartbeat_response)
    }
}

pub fn parse_heartbeat_response(s: NomBytes) -> IResult<NomBytes, HeartbeatResponse> {
    let (s, error_code) = parser::parse_kafka_code(s)?;
    Ok((s, HeartbeatResponse { error_code }))
}
