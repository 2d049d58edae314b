//! Parsing and processing for JoinGroup responses.
//!
//! Only the leader receives the member list; followers get an empty one.
//! Every successful join starts a new generation, and requests carrying
//! an older generation are rejected with `ILLEGAL_GENERATION`.
//!
//! ### Protocol Def
//! ```text
//! JoinGroup Response (Version: 2) => throttle_time_ms error_code generation_id protocol_name leader member_id [members]
//!   throttle_time_ms => INT32
//!   error_code => INT16
//!   generation_id => INT32
//!   protocol_name => STRING
//!   leader => STRING
//!   member_id => STRING
//!   members => member_id metadata
//!     member_id => STRING
//!     metadata => BYTES
//! ```

use bytes::Bytes;
use nom::{
    number::complete::{be_i16, be_i32},
    IResult,
};
use nombytes::NomBytes;

use super::request::Subscription;
use crate::{
    error::{Error, KafkaCode, Result},
    parser::{self, parse_array},
    protocol::parse_body,
};

#[derive(Debug, PartialEq)]
pub struct JoinGroupResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    pub generation_id: i32,
    /// The assignor the coordinator picked.
    pub protocol_name: String,
    pub leader: String,
    pub member_id: String,
    pub members: Vec<Member>,
}

#[derive(Debug, PartialEq)]
pub struct Member {
    pub member_id: String,
    pub metadata: Bytes,
}

impl JoinGroupResponse {
    pub fn is_leader(&self) -> bool {
        !self.member_id.is_empty() && self.leader == self.member_id
    }
}

impl Member {
    pub fn subscription(&self) -> Result<Subscription> {
        parse_body("Subscription", self.metadata.clone(), parse_subscription)
    }
}

impl TryFrom<Bytes> for JoinGroupResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("JoinGroupResponse", s, parse_join_group_response)
    }
}

pub fn parse_join_group_response(s: NomBytes) -> IResult<NomBytes, JoinGroupResponse> {
    let (s, throttle_time_ms) = be_i32(s)?;
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, generation_id) = be_i32(s)?;
    let (s, protocol_name) = parser::parse_str(s)?;
    let (s, leader) = parser::parse_str(s)?;
    let (s, member_id) = parser::parse_str(s)?;
    let (s, members) = parse_array(parse_member)(s)?;

    Ok((
        s,
        JoinGroupResponse {
            throttle_time_ms,
            error_code,
            generation_id,
            protocol_name,
            leader,
            member_id,
            members,
        },
    ))
}

fn parse_member(s: NomBytes) -> IResult<NomBytes, Member> {
    let (s, member_id) = parser::parse_str(s)?;
    let (s, metadata) = parser::parse_bytes(s)?;

    Ok((
        s,
        Member {
            member_id,
            metadata,
        },
    ))
}

/// Newer subscription versions append fields, so anything after
/// `user_data` is left unread.
pub fn parse_subscription(s: NomBytes) -> IResult<NomBytes, Subscription> {
    let (s, version) = be_i16(s)?;
    let (s, topics) = parse_array(parser::parse_str)(s)?;
    let (s, user_data) = parser::parse_nullable_bytes(s)?;
    Ok((
        s,
        Subscription {
            version,
            topics,
            user_data,
        },
    ))
}
