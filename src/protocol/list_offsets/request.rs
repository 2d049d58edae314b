//! Encoding and creation for ListOffsets requests.
//!
//! The timestamp asks for the first offset at or after that time. Two
//! sentinels stand for the ends of the log: [`LATEST_TIMESTAMP`] yields
//! the offset the next record will get and [`EARLIEST_TIMESTAMP`] the
//! oldest retained one.
//!
//! ### Protocol Def
//! ```text
//! ListOffsets Request (Version: 1) => replica_id [topics]
//!   replica_id => INT32
//!   topics => name [partitions]
//!     name => STRING
//!     partitions => partition_index timestamp
//!       partition_index => INT32
//!       timestamp => INT64
//! ```

use bytes::BufMut;

use crate::{
    encode::{encode_as_array, ToByte},
    error::Result,
    protocol::{ApiKey, KafkaRequest, ListOffsetsResponse},
};

pub const LATEST_TIMESTAMP: i64 = -1;
pub const EARLIEST_TIMESTAMP: i64 = -2;

#[derive(Debug, Clone)]
pub struct ListOffsetsRequest {
    pub replica_id: i32,
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub name: String,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub partition_index: i32,
    pub timestamp: i64,
}

impl Default for ListOffsetsRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl ListOffsetsRequest {
    pub fn new() -> Self {
        Self {
            replica_id: -1,
            topics: vec![],
        }
    }

    pub fn add(&mut self, topic: &str, partition_index: i32, timestamp: i64) {
        let partition = Partition {
            partition_index,
            timestamp,
        };
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(partition),
            None => self.topics.push(Topic {
                name: topic.to_owned(),
                partitions: vec![partition],
            }),
        }
    }
}

impl KafkaRequest for ListOffsetsRequest {
    const API_KEY: ApiKey = ApiKey::ListOffsets;
    const API_VERSION: i16 = 1;
    type Response = ListOffsetsResponse;
}

impl ToByte for ListOffsetsRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding ListOffsetsRequest {:?}", self);
        self.replica_id.encode(buffer)?;
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition_index.encode(buffer)?;
                p.timestamp.encode(buffer)
            })
        })
    }
}
