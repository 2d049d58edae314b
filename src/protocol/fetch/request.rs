//! Encoding and creation for Fetch requests.
//!
//! ### Protocol Def
//! ```text
//! Fetch Request (Version: 4) => replica_id max_wait_ms min_bytes max_bytes isolation_level [topics]
//!   replica_id => INT32
//!   max_wait_ms => INT32
//!   min_bytes => INT32
//!   max_bytes => INT32
//!   isolation_level => INT8
//!   topics => topic [partitions]
//!     topic => STRING
//!     partitions => partition fetch_offset partition_max_bytes
//!       partition => INT32
//!       fetch_offset => INT64
//!       partition_max_bytes => INT32
//! ```

use bytes::BufMut;

use crate::{
    encode::{encode_as_array, ToByte},
    error::Result,
    protocol::{ApiKey, FetchResponse, KafkaRequest},
};

/// Consumers always identify as replica -1.
const CONSUMER_REPLICA_ID: i32 = -1;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub replica: i32,
    /// How long the broker may hold the request while waiting for `min_bytes`.
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    /// 0 is READ_UNCOMMITTED, 1 is READ_COMMITTED.
    pub isolation_level: i8,
    pub topics: Vec<TopicPartitions>,
}

#[derive(Debug, Clone)]
pub struct TopicPartitions {
    pub topic_name: String,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub partition_index: i32,
    pub fetch_offset: i64,
    pub max_bytes: i32,
}

impl FetchRequest {
    pub fn new(max_wait_ms: i32, min_bytes: i32, max_bytes: i32, isolation_level: i8) -> Self {
        Self {
            replica: CONSUMER_REPLICA_ID,
            max_wait_ms,
            min_bytes,
            max_bytes,
            isolation_level,
            topics: vec![],
        }
    }

    /// Add a partition to fetch. Adding the same partition twice keeps the first offset.
    pub fn add(&mut self, topic_name: &str, partition_index: i32, fetch_offset: i64, max_bytes: i32) {
        let partition = Partition {
            partition_index,
            fetch_offset,
            max_bytes,
        };
        match self
            .topics
            .iter_mut()
            .find(|topic| topic.topic_name == topic_name)
        {
            None => self.topics.push(TopicPartitions {
                topic_name: topic_name.to_owned(),
                partitions: vec![partition],
            }),
            Some(topic) => {
                if !topic
                    .partitions
                    .iter()
                    .any(|p| p.partition_index == partition_index)
                {
                    topic.partitions.push(partition)
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl KafkaRequest for FetchRequest {
    const API_KEY: ApiKey = ApiKey::Fetch;
    const API_VERSION: i16 = 4;
    type Response = FetchResponse;
}

impl ToByte for FetchRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        tracing::trace!("Encoding FetchRequest {:?}", self);
        self.replica.encode(buffer)?;
        self.max_wait_ms.encode(buffer)?;
        self.min_bytes.encode(buffer)?;
        self.max_bytes.encode(buffer)?;
        self.isolation_level.encode(buffer)?;
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.topic_name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition_index.encode(buffer)?;
                p.fetch_offset.encode(buffer)?;
                p.max_bytes.encode(buffer)
            })
        })
    }
}
