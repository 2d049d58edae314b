//! Parsing and processing for Metadata responses.
//!
//! ### Protocol Def
//! ```text
//! Metadata Response (Version: 1) => [brokers] controller_id [topics]
//!   brokers => node_id host port rack
//!     node_id => INT32
//!     host => STRING
//!     port => INT32
//!     rack => NULLABLE_STRING
//!   controller_id => INT32
//!   topics => error_code name is_internal [partitions]
//!     error_code => INT16
//!     name => STRING
//!     is_internal => BOOLEAN
//!     partitions => error_code partition_index leader_id [replica_nodes] [isr_nodes]
//!       error_code => INT16
//!       partition_index => INT32
//!       leader_id => INT32
//!       replica_nodes => INT32
//!       isr_nodes => INT32
//! ```

use bytes::Bytes;
use nom::{
    number::complete::{be_i32, be_i8},
    IResult,
};
use nombytes::NomBytes;

use crate::{
    error::{Error, KafkaCode, Result},
    parser,
    protocol::parse_body,
};

#[derive(Debug, Default, PartialEq)]
pub struct MetadataResponse {
    pub brokers: Vec<Broker>,
    pub controller_id: i32,
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub error_code: KafkaCode,
    pub name: String,
    pub is_internal: bool,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub error_code: KafkaCode,
    pub partition_index: i32,
    /// -1 while an election is in progress.
    pub leader_id: i32,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
}

impl TryFrom<Bytes> for MetadataResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("MetadataResponse", s, parse_metadata_response)
    }
}

pub fn parse_metadata_response(s: NomBytes) -> IResult<NomBytes, MetadataResponse> {
    let (s, brokers) = parser::parse_array(parse_broker)(s)?;
    let (s, controller_id) = be_i32(s)?;
    let (s, topics) = parser::parse_array(parse_topic)(s)?;

    Ok((
        s,
        MetadataResponse {
            brokers,
            controller_id,
            topics,
        },
    ))
}

fn parse_broker(s: NomBytes) -> IResult<NomBytes, Broker> {
    let (s, node_id) = be_i32(s)?;
    let (s, host) = parser::parse_str(s)?;
    let (s, port) = be_i32(s)?;
    let (s, rack) = parser::parse_nullable_str(s)?;

    Ok((
        s,
        Broker {
            node_id,
            host,
            port,
            rack,
        },
    ))
}

fn parse_topic(s: NomBytes) -> IResult<NomBytes, Topic> {
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, name) = parser::parse_str(s)?;
    let (s, is_internal) = be_i8(s)?;
    let (s, partitions) = parser::parse_array(parse_partition)(s)?;

    Ok((
        s,
        Topic {
            error_code,
            name,
            is_internal: is_internal != 0,
            partitions,
        },
    ))
}

fn parse_partition(s: NomBytes) -> IResult<NomBytes, Partition> {
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, partition_index) = be_i32(s)?;
    let (s, leader_id) = be_i32(s)?;
    let (s, replica_nodes) = parser::parse_array(be_i32)(s)?;
    let (s, isr_nodes) = parser::parse_array(be_i32)(s)?;

    Ok((
        s,
        Partition {
            error_code,
            partition_index,
            leader_id,
            replica_nodes,
            isr_nodes,
        },
    ))
}
