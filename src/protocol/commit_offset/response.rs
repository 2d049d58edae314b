//! Parsing and processing for OffsetCommit responses.
//!
//! ### Protocol Def
//! ```text
//! OffsetCommit Response (Version: 2) => [topics]
//!   topics => name [partitions]
//!     name => STRING
//!     partitions => partition_index error_code
//!       partition_index => INT32
//!       error_code => INT16
//! ```

use bytes::Bytes;
use nom::{number::complete::be_i32, IResult};
use nombytes::NomBytes;

use crate::{
    error::{Error, KafkaCode, Result},
    parser,
    protocol::parse_body,
};

#[derive(Debug, PartialEq)]
pub struct OffsetCommitResponse {
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
}

impl OffsetCommitResponse {
    pub fn first_error(&self) -> Option<(&str, i32, KafkaCode)> {
        self.topics.iter().find_map(|t| {
            t.partitions
                .iter()
                .find(|p| !p.error_code.is_ok())
                .map(|p| (t.name.as_str(), p.partition_index, p.error_code))
        })
    }
}

impl TryFrom<Bytes> for OffsetCommitResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("OffsetCommitResponse", s, parse_offset_commit_response)
    }
}

pub fn parse_offset_commit_response(s: NomBytes) -> IResult<NomBytes, OffsetCommitResponse> {
    let (s, topics) = parser::parse_array(parse_topic)(s)?;
    Ok((s, OffsetCommitResponse { topics }))
}

fn parse_topic(s: NomBytes) -> IResult<NomBytes, Topic> {
    let (s, name) = parser::parse_str(s)?;
    let (s, partitions) = parser::parse_array(parse_partition)(s)?;
    Ok((s, Topic { name, partitions }))
}

fn parse_partition(s: NomBytes) -> IResult<NomBytes, Partition> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = parser::parse_kafka_code(s)?;
    Ok((
        s,
        Partition {
            partition_index,
            error_code,
        },
    ))
}
