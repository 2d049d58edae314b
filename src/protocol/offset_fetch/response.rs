//! Parsing and processing for OffsetFetch responses.
//!
//! ### Protocol Def
//! ```text
//! OffsetFetch Response (Version: 2) => [topics] error_code
//!   topics => name [partitions]
//!     name => STRING
//!     partitions => partition_index committed_offset metadata error_code
//!       partition_index => INT32
//!       committed_offset => INT64
//!       metadata => NULLABLE_STRING
//!       error_code => INT16
//!   error_code => INT16
//! ```
//!
//! A partition the group never committed comes back with offset -1.

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
pub struct OffsetFetchResponse {
    pub topics: Vec<Topic>,
    pub error_code: KafkaCode,
}

#[derive(Debug, PartialEq)]
pub struct Topic {
    pub name: String,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, PartialEq)]
pub struct Partition {
    pub partition_index: i32,
    pub committed_offset: i64,
    pub metadata: Option<String>,
    pub error_code: KafkaCode,
}

impl OffsetFetchResponse {
    /// The committed offset of a partition, if there is one.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.topics
            .iter()
            .filter(|t| t.name == topic)
            .flat_map(|t| t.partitions.iter())
            .find(|p| p.partition_index == partition)
            .filter(|p| p.error_code.is_ok() && p.committed_offset >= 0)
            .map(|p| p.committed_offset)
    }
}

impl TryFrom<Bytes> for OffsetFetchResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("OffsetFetchResponse", s, parse_offset_fetch_response)
    }
}

pub fn parse_offset_fetch_response(s: NomBytes) -> IResult<NomBytes, OffsetFetchResponse> {
    let (s, topics) = parser::parse_array(parse_topic)(s)?;
    let (s, error_code) = parser::parse_kafka_code(s)?;
    Ok((s, OffsetFetchResponse { topics, error_code }))
}

fn parse_topic(s: NomBytes) -> IResult<NomBytes, Topic> {
    let (s, name) = parser::parse_str(s)?;
    let (s, partitions) = parser::parse_array(parse_partition)(s)?;
    Ok((s, Topic { name, partitions }))
}

fn parse_partition(s: NomBytes) -> IResult<NomBytes, Partition> {
    let (s, partition_index) = be_i32(s)?;
    let (s, committed_offset) = be_i64(s)?;
    let (s, metadata) = parser::parse_nullable_str(s)?;
    let (s, error_code) = parser::parse_kafka_code(s)?;
    Ok((
        s,
        Partition {
            partition_index,
            committed_offset,
            metadata,
            error_code,
        },
    ))
}
