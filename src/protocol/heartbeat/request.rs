//! Encoding and creation for Heartbeat requests.
//!
//! A member that stops heartbeating for longer than its session timeout
//! is removed from the group and its partitions are handed to others.
//!
//! ### Protocol Def
//! ```text
//! Heartbeat Request (Version: 0) => group_id generation_id member_id
//!   group_id => STRING
//!   generation_id => INT32
//!   member_id => STRING
//! ```

use bytes::BufMut;

use crate::{
    encode::ToByte,
    error::Result,
    protocol::{ApiKey, HeartbeatResponse, KafkaRequest},
};

#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
}

impl HeartbeatRequest {
    pub fn new(group_id: &str, generation_id: i32, member_id: &str) -> Self {
        Self {
            group_id: group_id.to_owned(),
            generation_id,
            member_id: member_id.to_owned(),
        }
    }
}

impl KafkaRequest for HeartbeatRequest {
    const API_KEY: ApiKey = ApiKey::Heartbeat;
    const API_VERSION: i16 = 0;
    type Response = HeartbeatResponse;
}

impl ToByte for HeartbeatRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding HeartbeatRequest {:?}", self);
        self.group_id.encode(buffer)?;
        self.generation_id.encode(buffer)?;
        self.member_id.encode(buffer)
    }
}
