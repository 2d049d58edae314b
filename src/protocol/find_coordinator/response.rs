//! Parsing and processing for FindCoordinator responses.
//!
//! ### Protocol Def
//! ```text
//! FindCoordinator Response (Version: 0) => error_code node_id host port
//!   error_code => INT16
//!   node_id => INT32
//!   host => STRING
//!   port => INT32
//! ```

use bytes::Bytes;
use nom::{number::complete::be_i32, IResult};
use nombytes::NomBytes;

use crate::{
    error::{Error, KafkaCode, Result},
    parser,
    protocol::parse_body,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindCoordinatorResponse {
    pub error_code: KafkaCode,
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl TryFrom<Bytes> for FindCoordinatorResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("FindCoordinatorResponse", s, parse_find_coordinator_response)
    }
}

pub fn parse_find_coordinator_response(s: NomBytes) -> IResult<NomBytes, FindCoordinatorResponse> {
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, node_id) = be_i32(s)?;
    let (s, host) = parser::parse_str(s)?;
    let (s, port) = be_i32(s)?;

    Ok((
        s,
        FindCoordinatorResponse {
            error_code,
            node_id,
            host,
            port,
        },
    ))
}
