//! Parsing and processing for Produce responses.
//!
//! ### Protocol Def
//! ```text
//! Produce Response (Version: 3) => [responses] throttle_time_ms
//!   responses => name [partition_responses]
//!     name => STRING
//!     partition_responses => index error_code base_offset log_append_time_ms
//!       index => INT32
//!       error_code => INT16
//!       base_offset => INT64
//!       log_append_time_ms => INT64
//!   throttle_time_ms => INT32
//! ```
//!
//! Brokers send no response at all when `acks` is 0.

use bytes::Bytes;
use nom::{
    number::complete::{be_i32, be_i64},
    IResult,
};
use nombytes::NomBytes;

use crate::{
    error::{Error, KafkaCode, Result},
    parser,
    protocol::parse_body,
};

#[derive(Debug, PartialEq)]
pub struct ProduceResponse {
    pub responses: Vec<Response>,
    pub throttle_time_ms: i32,
}

#[derive(Debug, PartialEq)]
pub struct Response {
    pub name: String,
    pub partition_responses: Vec<PartitionResponse>,
}

#[derive(Debug, PartialEq)]
pub struct PartitionResponse {
    pub index: i32,
    pub error_code: KafkaCode,
    /// Offset assigned to the first record of the batch.
    pub base_offset: i64,
    /// -1 unless the topic uses log append time.
    pub log_append_time_ms: i64,
}

impl ProduceResponse {
    pub fn partition(&self, topic: &str, index: i32) -> Option<&PartitionResponse> {
        self.responses
            .iter()
            .filter(|r| r.name == topic)
            .flat_map(|r| r.partition_responses.iter())
            .find(|p| p.index == index)
    }
}

impl TryFrom<Bytes> for ProduceResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("ProduceResponse", s, parse_produce_response)
    }
}

pub fn parse_produce_response(s: NomBytes) -> IResult<NomBytes, ProduceResponse> {
    let (s, responses) = parser::parse_array(parse_response)(s)?;
    let (s, throttle_time_ms) = be_i32(s)?;
    Ok((
        s,
        ProduceResponse {
            responses,
            throttle_time_ms,
        },
    ))
}

fn parse_response(s: NomBytes) -> IResult<NomBytes, Response> {
    let (s, name) = parser::parse_str(s)?;
    let (s, partition_responses) = parser::parse_array(parse_partition_response)(s)?;
    Ok((
        s,
        Response {
            name,
            partition_responses,
        },
    ))
}

fn parse_partition_response(s: NomBytes) -> IResult<NomBytes, PartitionResponse> {
    let (s, index) = be_i32(s)?;
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, base_offset) = be_i64(s)?;
    let (s, log_append_time_ms) = be_i64(s)?;
    Ok((
        s,
        PartitionResponse {
            index,
            error_code,
            base_offset,
            log_append_time_ms,
        },
    ))
}
