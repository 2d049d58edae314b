//! Encoding and creation for Metadata requests.
//!
//! ### Protocol Def
//! ```text
//! Metadata Request (Version: 1) => [topics]
//!   topics => name
//!     name => STRING
//! ```
//!
//! A null topic array asks for every topic in the cluster, an empty one
//! for brokers only.

use bytes::BufMut;

use crate::{
    encode::{AsStrings, ToByte},
    error::Result,
    protocol::{ApiKey, KafkaRequest, MetadataResponse},
};

#[derive(Debug, Clone)]
pub struct MetadataRequest {
    pub topics: Option<Vec<String>>,
}

impl MetadataRequest {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            topics: Some(topics),
        }
    }

    pub fn all_topics() -> Self {
        Self { topics: None }
    }
}

impl KafkaRequest for MetadataRequest {
    const API_KEY: ApiKey = ApiKey::Metadata;
    const API_VERSION: i16 = 1;
    type Response = MetadataResponse;
}

impl ToByte for MetadataRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding MetadataRequest {:?}", self);
        match &self.topics {
            Some(topics) => AsStrings(topics).encode(buffer),
            None => (-1i32).encode(buffer),
        }
    }
}
