//! Parsing for LeaveGroup responses.
//!
//! ### Protocol Def
//! ```text
//! LeaveGroup Response (Version: 0) => error_code
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
pub struct LeaveGroupResponse {
    pub error_code: KafkaCode,
}

impl TryFrom<Bytes> for LeaveGroupResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("LeaveGroupResponse", s, parse_leave_group_response)
    }
}

pub fn parse_leave_group_response(s: NomBytes) -> IResult<NomBytes, LeaveGroupResponse> {
    let (s, error_code) = parser::parse_kafka_code(s)?;
    Ok((s, LeaveGroupResponse { error_code }))
}
