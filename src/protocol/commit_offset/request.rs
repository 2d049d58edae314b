//! Encoding and creation for OffsetCommit requests.
//!
//! The committed offset is the position of the next record to read, one
//! past the last record processed.
//!
//! ### Protocol Def
//! ```text
//! OffsetCommit Request (Version: 2) => group_id generation_id member_id retention_time_ms [topics]
//!   group_id => STRING
//!   generation_id => INT32
//!   member_id => STRING
//!   retention_time_ms => INT64
//!   topics => name [partitions]
//!     name => STRING
//!     partitions => partition_index committed_offset committed_metadata
//!       partition_index => INT32
//!       committed_offset => INT64
//!       committed_metadata => NULLABLE_STRING
//! ```

use bytes::BufMut;

use crate::{
    encode::{encode_as_array, ToByte},
    error::Result,
    protocol::{ApiKey, KafkaRequest, OffsetCommitResponse},
};

/// Let the broker apply `offsets.retention.minutes`.
const BROKER_RETENTION: i64 = -1;

#[derive(Debug, Clone)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub retention_time_ms: i64,
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
    pub committed_offset: i64,
    pub committed_metadata: Option<String>,
}

impl OffsetCommitRequest {
    pub fn new(group_id: &str, generation_id: i32, member_id: &str) -> Self {
        Self {
            group_id: group_id.to_owned(),
            generation_id,
            member_id: member_id.to_owned(),
            retention_time_ms: BROKER_RETENTION,
            topics: vec![],
        }
    }

    pub fn add(
        &mut self,
        topic: &str,
        partition_index: i32,
        committed_offset: i64,
        committed_metadata: Option<&str>,
    ) {
        let partition = Partition {
            partition_index,
            committed_offset,
            committed_metadata: committed_metadata.map(str::to_owned),
        };
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(partition),
            None => self.topics.push(Topic {
                name: topic.to_owned(),
                partitions: vec![partition],
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl KafkaRequest for OffsetCommitRequest {
    const API_KEY: ApiKey = ApiKey::OffsetCommit;
    const API_VERSION: i16 = 2;
    type Response = OffsetCommitResponse;
}

impl ToByte for OffsetCommitRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding OffsetCommitRequest {:?}", self);
        self.group_id.encode(buffer)?;
        self.generation_id.encode(buffer)?;
        self.member_id.encode(buffer)?;
        self.retention_time_ms.encode(buffer)?;
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition_index.encode(buffer)?;
                p.committed_offset.encode(buffer)?;
                p.committed_metadata.as_deref().encode(buffer)
            })
        })
    }
}
