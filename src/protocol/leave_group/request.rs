//! Encoding and creation for LeaveGroup requests.
//!
//! ### Protocol Def
//! ```text
//! LeaveGroup Request (Version: 0) => group_id member_id
//!   group_id => STRING
//!   member_id => STRING
//! ```

use bytes::BufMut;

use crate::{
    encode::ToByte,
    error::Result,
    protocol::{ApiKey, KafkaRequest, LeaveGroupResponse},
};

#[derive(Debug, Clone)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub member_id: String,
}

impl LeaveGroupRequest {
    pub fn new(group_id: &str, member_id: &str) -> Self {
        Self {
            group_id: group_id.to_owned(),
            member_id: member_id.to_owned(),
        }
    }
}

impl KafkaRequest for LeaveGroupRequest {
    const API_KEY: ApiKey = ApiKey::LeaveGroup;
    const API_VERSION: i16 = 0;
    type Response = LeaveGroupResponse;
}

impl ToByte for LeaveGroupRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding LeaveGroupRequest {:?}", self);
        self.group_id.encode(buffer)?;
        self.member_id.encode(buffer)
    }
}
