//! Encoding and creation for OffsetFetch requests.
//!
//! ### Protocol Def
//! ```text
//! OffsetFetch Request (Version: 2) => group_id [topics]
//!   group_id => STRING
//!   topics => name [partition_indexes]
//!     name => STRING
//!     partition_indexes => INT32
//! ```

use bytes::BufMut;

use crate::{
    encode::{encode_as_array, ToByte},
    error::Result,
    protocol::{ApiKey, KafkaRequest, OffsetFetchResponse},
};

#[derive(Debug, Clone)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub name: String,
    pub partition_indexes: Vec<i32>,
}

impl OffsetFetchRequest {
    pub fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_owned(),
            topics: vec![],
        }
    }

    pub fn add(&mut self, topic: &str, partition_index: i32) {
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partition_indexes.push(partition_index),
            None => self.topics.push(Topic {
                name: topic.to_owned(),
                partition_indexes: vec![partition_index],
            }),
        }
    }
}

impl KafkaRequest for OffsetFetchRequest {
    const API_KEY: ApiKey = ApiKey::OffsetFetch;
    const API_VERSION: i16 = 2;
    type Response = OffsetFetchResponse;
}

impl ToByte for OffsetFetchRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding OffsetFetchRequest {:?}", self);
        self.group_id.encode(buffer)?;
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            topic.partition_indexes.as_slice().encode(buffer)
        })
    }
}
