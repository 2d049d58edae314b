//! Encoding and creation for Produce requests.
//!
//! ### Protocol Def
//! ```text
//! Produce Request (Version: 3) => transactional_id acks timeout_ms [topic_data]
//!   transactional_id => NULLABLE_STRING
//!   acks => INT16
//!   timeout_ms => INT32
//!   topic_data => name [partition_data]
//!     name => STRING
//!     partition_data => index records
//!       index => INT32
//!       records => RECORDS
//! ```
//!
//! Version 3 is the first to carry v2 record batches.

use bytes::{BufMut, Bytes};

use crate::{
    encode::{encode_as_array, ToByte},
    error::Result,
    protocol::{ApiKey, KafkaRequest, ProduceResponse},
};

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    /// 0 for no acknowledgment, 1 for the leader only and -1 for the full ISR.
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<TopicProduceData>,
}

#[derive(Debug, Clone)]
pub struct TopicProduceData {
    pub name: String,
    pub partitions: Vec<PartitionProduceData>,
}

#[derive(Debug, Clone)]
pub struct PartitionProduceData {
    pub index: i32,
    /// Encoded record batches.
    pub records: Bytes,
}

impl ProduceRequest {
    pub fn new(acks: i16, timeout_ms: i32) -> Self {
        Self {
            transactional_id: None,
            acks,
            timeout_ms,
            topics: vec![],
        }
    }

    pub fn add(&mut self, topic: &str, partition: i32, records: Bytes) {
        let data = PartitionProduceData {
            index: partition,
            records,
        };
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(data),
            None => self.topics.push(TopicProduceData {
                name: topic.to_owned(),
                partitions: vec![data],
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl KafkaRequest for ProduceRequest {
    const API_KEY: ApiKey = ApiKey::Produce;
    const API_VERSION: i16 = 3;
    type Response = ProduceResponse;
}

impl ToByte for ProduceRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        tracing::trace!("Encoding ProduceRequest {:?}", self);
        self.transactional_id.as_deref().encode(buffer)?;
        self.acks.encode(buffer)?;
        self.timeout_ms.encode(buffer)?;
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.index.encode(buffer)?;
                p.records.encode(buffer)
            })
        })
    }
}
