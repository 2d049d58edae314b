//! Parsing and processing for SyncGroup responses.
//!
//! ### Protocol Def
//! ```text
//! SyncGroup Response (Version: 2) => throttle_time_ms error_code assignment
//!   throttle_time_ms => INT32
//!   error_code => INT16
//!   assignment => BYTES
//! ```
//!
//! A member with nothing assigned may get zero assignment bytes.

use bytes::Bytes;
use nom::{
    number::complete::{be_i16, be_i32},
    IResult,
};
use nombytes::NomBytes;

use super::request::{MemberAssignment, PartitionAssignment};
use crate::{
    error::{Error, KafkaCode, Result},
    parser,
    protocol::parse_body,
};

#[derive(Debug, PartialEq)]
pub struct SyncGroupResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    pub assignment: MemberAssignment,
}

impl TryFrom<Bytes> for SyncGroupResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("SyncGroupResponse", s, parse_sync_group_response)
    }
}

pub fn parse_sync_group_response(s: NomBytes) -> IResult<NomBytes, SyncGroupResponse> {
    let (s, throttle_time_ms) = be_i32(s)?;
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, raw) = parser::parse_nullable_bytes(s)?;
    let assignment = match raw {
        Some(raw) if !raw.is_empty() => parse_member_assignment(NomBytes::new(raw))?.1,
        _ => MemberAssignment::default(),
    };

    Ok((
        s,
        SyncGroupResponse {
            throttle_time_ms,
            error_code,
            assignment,
        },
    ))
}

pub fn parse_member_assignment(s: NomBytes) -> IResult<NomBytes, MemberAssignment> {
    let (s, version) = be_i16(s)?;
    let (s, partition_assignments) = parser::parse_array(parse_partition_assignment)(s)?;
    let (s, user_data) = parser::parse_nullable_bytes(s)?;

    Ok((
        s,
        MemberAssignment {
            version,
            partition_assignments,
            user_data,
        },
    ))
}

fn parse_partition_assignment(s: NomBytes) -> IResult<NomBytes, PartitionAssignment> {
    let (s, topic_name) = parser::parse_str(s)?;
    let (s, partitions) = parser::parse_array(be_i32)(s)?;

    Ok((
        s,
        PartitionAssignment {
            topic_name,
            partitions,
        },
    ))
}
