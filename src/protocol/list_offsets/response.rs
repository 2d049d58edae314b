//! Parsing and processing for ListOffsets responses.
//!
//! ### Protocol Def
//! ```text
//! ListOffsets Response (Version: 1) => [topics]
//!   topics => name [partitions]
//!     name => STRING
//!     partitions => partition_index error_code timestamp offset
//!       partition_index => INT32
//!       error_code => INT16
//!       timestamp => INT64
//!       offset => INT64
//! ```

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
pub struct ListOffsetsResponse {
    pub topics: Vec<Topic>,
}

#[derive(Debug, PartialEq)]
pub struct Topic {
    pub name: String,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, PartialEq)]
pub struct Partition {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub timestamp: i64,
    pub offset: i64,
}

impl ListOffsetsResponse {
    /// The offset for a partition, if the broker returned one without error.
    pub fn offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.topics
            .iter()
            .filter(|t| t.name == topic)
            .flat_map(|t| t.partitions.iter())
            .find(|p| p.partition_index == partition && p.error_code.is_ok())
            .map(|p| p.offset)
    }
}

impl TryFrom<Bytes> for ListOffsetsResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("ListOffsetsResponse", s, parse_list_offsets_response)
    }
}

pub fn parse_list_offsets_response(s: NomBytes) -> IResult<NomBytes, ListOffsetsResponse> {
    let (s, topics) = parser::parse_array(parse_topic)(s)?;
    Ok((s, ListOffsetsResponse { topics }))
}

fn parse_topic(s: NomBytes) -> IResult<NomBytes, Topic> {
    let (s, name) = parser::parse_str(s)?;
    let (s, partitions) = parser::parse_array(parse_partition)(s)?;
    Ok((s, Topic { name, partitions }))
}

fn parse_partition(s: NomBytes) -> IResult<NomBytes, Partition> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, timestamp) = be_i64(s)?;
    let (s, offset) = be_i64(s)?;
    Ok((
        s,
        Partition {
            partition_index,
            error_code,
            timestamp,
            offset,
        },
    ))
}
