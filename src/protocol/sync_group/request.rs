//! Encoding and creation for SyncGroup requests.
//!
//! Every member sends SyncGroup right after joining. Only the leader's
//! request carries assignments; followers send an empty list and wait
//! for theirs in the response.
//!
//! ### Protocol Def
//! ```text
//! SyncGroup Request (Version: 2) => group_id generation_id member_id [assignments]
//!   group_id => STRING
//!   generation_id => INT32
//!   member_id => STRING
//!   assignments => member_id assignment
//!     member_id => STRING
//!     assignment => BYTES
//!
//! MemberAssignment (Version: 0) => version [partition_assignments] user_data
//!   version => INT16
//!   partition_assignments => topic [partitions]
//!     topic => STRING
//!     partitions => INT32
//!   user_data => NULLABLE_BYTES
//! ```

use bytes::{BufMut, Bytes};

use crate::{
    encode::{encode_as_array, ToByte},
    error::Result,
    protocol::{ApiKey, KafkaRequest, SyncGroupResponse},
};

const ASSIGNMENT_VERSION: i16 = 0;

#[derive(Debug, Clone)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub member_id: String,
    pub assignment: MemberAssignment,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberAssignment {
    pub version: i16,
    pub partition_assignments: Vec<PartitionAssignment>,
    pub user_data: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub topic_name: String,
    pub partitions: Vec<i32>,
}

impl Assignment {
    pub fn new(member_id: &str, assignment: MemberAssignment) -> Self {
        Self {
            member_id: member_id.to_owned(),
            assignment,
        }
    }
}

impl MemberAssignment {
    pub fn new(partition_assignments: Vec<PartitionAssignment>) -> Self {
        Self {
            version: ASSIGNMENT_VERSION,
            partition_assignments,
            user_data: None,
        }
    }

    /// Flattened `(topic, partition)` pairs in assignment order.
    pub fn topic_partitions(&self) -> Vec<(String, i32)> {
        self.partition_assignments
            .iter()
            .flat_map(|a| a.partitions.iter().map(|p| (a.topic_name.clone(), *p)))
            .collect()
    }

    /// The assignment without its outer byte-string length.
    pub(crate) fn encode_inner<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.version.encode(buffer)?;
        encode_as_array(buffer, &self.partition_assignments, |buffer, a| {
            a.topic_name.encode(buffer)?;
            a.partitions.as_slice().encode(buffer)
        })?;
        self.user_data.encode(buffer)
    }
}

impl PartitionAssignment {
    pub fn new(topic_name: &str, partitions: Vec<i32>) -> Self {
        Self {
            topic_name: topic_name.to_owned(),
            partitions,
        }
    }
}

impl SyncGroupRequest {
    pub fn new(
        group_id: &str,
        generation_id: i32,
        member_id: &str,
        assignments: Vec<Assignment>,
    ) -> Self {
        Self {
            group_id: group_id.to_owned(),
            generation_id,
            member_id: member_id.to_owned(),
            assignments,
        }
    }
}

impl KafkaRequest for SyncGroupRequest {
    const API_KEY: ApiKey = ApiKey::SyncGroup;
    const API_VERSION: i16 = 2;
    type Response = SyncGroupResponse;
}

impl ToByte for SyncGroupRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding SyncGroupRequest {:?}", self);
        self.group_id.encode(buffer)?;
        self.generation_id.encode(buffer)?;
        self.member_id.encode(buffer)?;
        encode_as_array(buffer, &self.assignments, |buffer, a| {
            a.member_id.encode(buffer)?;
            a.assignment.encode(buffer)
        })
    }
}

impl ToByte for MemberAssignment {
    // the assignment travels as an opaque byte string
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        let mut inner = Vec::with_capacity(32);
        self.encode_inner(&mut inner)?;
        inner.as_slice().encode(buffer)
    }
}
