//! Encoding and creation for JoinGroup requests.
//!
//! A member joining for the first time sends an empty member id. Brokers
//! that require one reject that join with `MEMBER_ID_REQUIRED` and put the
//! id to use in the response; the member then joins again with it.
//!
//! ### Protocol Def
//! ```text
//! JoinGroup Request (Version: 2) => group_id session_timeout_ms rebalance_timeout_ms member_id protocol_type [protocols]
//!   group_id => STRING
//!   session_timeout_ms => INT32
//!   rebalance_timeout_ms => INT32
//!   member_id => STRING
//!   protocol_type => STRING
//!   protocols => name metadata
//!     name => STRING
//!     metadata => BYTES
//!
//! Subscription (Version: 0) => version [topics] user_data
//!   version => INT16
//!   topics => STRING
//!   user_data => NULLABLE_BYTES
//! ```

use bytes::{BufMut, Bytes};

use crate::{
    encode::{encode_as_array, AsStrings, ToByte},
    error::Result,
    protocol::{ApiKey, JoinGroupResponse, KafkaRequest},
};

pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";
const SUBSCRIPTION_VERSION: i16 = 0;

#[derive(Debug, Clone)]
pub struct JoinGroupRequest {
    pub group_id: String,
    /// No heartbeat for this long and the coordinator drops the member.
    pub session_timeout_ms: i32,
    /// How long the coordinator waits for every member to rejoin.
    pub rebalance_timeout_ms: i32,
    pub member_id: String,
    pub protocol_type: String,
    /// In order of preference.
    pub protocols: Vec<Protocol>,
}

#[derive(Debug, Clone)]
pub struct Protocol {
    /// The assignor name.
    pub name: String,
    pub metadata: Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub version: i16,
    pub topics: Vec<String>,
    pub user_data: Option<Bytes>,
}

impl Protocol {
    pub fn new(name: &str, topics: Vec<String>) -> Self {
        Self {
            name: name.to_owned(),
            metadata: Subscription {
                version: SUBSCRIPTION_VERSION,
                topics,
                user_data: None,
            },
        }
    }
}

impl JoinGroupRequest {
    pub fn new(
        group_id: &str,
        session_timeout_ms: i32,
        rebalance_timeout_ms: i32,
        member_id: &str,
        protocols: Vec<Protocol>,
    ) -> Self {
        Self {
            group_id: group_id.to_owned(),
            session_timeout_ms,
            rebalance_timeout_ms,
            member_id: member_id.to_owned(),
            protocol_type: CONSUMER_PROTOCOL_TYPE.to_owned(),
            protocols,
        }
    }
}

impl KafkaRequest for JoinGroupRequest {
    const API_KEY: ApiKey = ApiKey::JoinGroup;
    const API_VERSION: i16 = 2;
    type Response = JoinGroupResponse;
}

impl ToByte for JoinGroupRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding JoinGroupRequest {:?}", self);
        self.group_id.encode(buffer)?;
        self.session_timeout_ms.encode(buffer)?;
        self.rebalance_timeout_ms.encode(buffer)?;
        self.member_id.encode(buffer)?;
        self.protocol_type.encode(buffer)?;
        encode_as_array(buffer, &self.protocols, |buffer, protocol| {
            protocol.name.encode(buffer)?;
            // the subscription travels as an opaque byte string
            let mut metadata = Vec::with_capacity(32);
            protocol.metadata.encode(&mut metadata)?;
            metadata.as_slice().encode(buffer)
        })
    }
}

impl ToByte for Subscription {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.version.encode(buffer)?;
        AsStrings(&self.topics).encode(buffer)?;
        self.user_data.encode(buffer)
    }
}
