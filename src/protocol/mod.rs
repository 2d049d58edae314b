//! Bytecode protocol requests & responses.
//!
//! This module aims to implement the bytecode protocol outlined in the
//! [Kafka Documentation](https://kafka.apache.org/protocol.html)
//!
//! The module is set up as a list of message pairs containing two files
//! each corresponding to the request and response.
//!
//! The request files hold the logic for creating and encoding structs that
//! will be sent to the broker. The response files hold the logic for parsing
//! and processing the messages coming from the broker.
//!
//! Request types encode only their body. The header, and the correlation ID
//! inside it, is added by the [`Connection`](crate::network::Connection)
//! when the request is put on the wire, so a request value can be built
//! once and sent on any connection.

pub mod commit_offset;
pub mod fetch;
pub mod find_coordinator;
pub mod heartbeat;
pub mod join_group;
pub mod leave_group;
pub mod list_offsets;
pub mod metadata;
pub mod offset_fetch;
pub mod produce;
pub mod records;
pub mod sasl_authenticate;
pub mod sasl_handshake;
pub mod sync_group;

use std::fmt::Debug;

use bytes::{BufMut, Bytes};
use nom::IResult;
use nombytes::NomBytes;
use num_derive::FromPrimitive;

// re exporting these for ease
pub use self::{
    commit_offset::{request::OffsetCommitRequest, response::OffsetCommitResponse},
    fetch::{request::FetchRequest, response::FetchResponse},
    find_coordinator::{request::FindCoordinatorRequest, response::FindCoordinatorResponse},
    heartbeat::{request::HeartbeatRequest, response::HeartbeatResponse},
    join_group::{request::JoinGroupRequest, response::JoinGroupResponse},
    leave_group::{request::LeaveGroupRequest, response::LeaveGroupResponse},
    list_offsets::{request::ListOffsetsRequest, response::ListOffsetsResponse},
    metadata::{request::MetadataRequest, response::MetadataResponse},
    offset_fetch::{request::OffsetFetchRequest, response::OffsetFetchResponse},
    produce::{request::ProduceRequest, response::ProduceResponse},
    records::{Compression, Header, Record, RecordBatch},
    sasl_authenticate::{request::SaslAuthenticateRequest, response::SaslAuthenticateResponse},
    sasl_handshake::{request::SaslHandshakeRequest, response::SaslHandshakeResponse},
    sync_group::{request::SyncGroupRequest, response::SyncGroupResponse},
};
use crate::{
    encode::ToByte,
    error::{Error, Result},
};

/// Numeric identifiers of the APIs this client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
pub enum ApiKey {
    Produce = 0,
    Fetch = 1,
    ListOffsets = 2,
    Metadata = 3,
    OffsetCommit = 8,
    OffsetFetch = 9,
    FindCoordinator = 10,
    JoinGroup = 11,
    Heartbeat = 12,
    LeaveGroup = 13,
    SyncGroup = 14,
    SaslHandshake = 17,
    SaslAuthenticate = 36,
}

/// A request body of a specific API and version, paired with the response
/// type the broker answers it with.
pub trait KafkaRequest: ToByte + Debug + Send + Sync {
    const API_KEY: ApiKey;
    const API_VERSION: i16;
    type Response: TryFrom<Bytes, Error = Error> + Debug + Send + 'static;
}

#[derive(Debug, Clone)]
pub struct HeaderRequest<'a> {
    /// The API key of this request.
    pub api_key: i16,
    /// The API version of this request.
    pub api_version: i16,
    /// The correlation ID of this request.
    pub correlation_id: i32,
    /// The client ID string.
    pub client_id: &'a str,
}

impl<'a> HeaderRequest<'a> {
    /// Create new header request.
    ///
    /// This goes at the beginning of every single request.
    pub fn new(
        api_key: i16,
        api_version: i16,
        correlation_id: i32,
        client_id: &'a str,
    ) -> HeaderRequest<'a> {
        HeaderRequest {
            api_key,
            api_version,
            correlation_id,
            client_id,
        }
    }

    pub fn for_request<R: KafkaRequest>(correlation_id: i32, client_id: &'a str) -> Self {
        Self::new(R::API_KEY as i16, R::API_VERSION, correlation_id, client_id)
    }
}

impl<'a> ToByte for HeaderRequest<'a> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.api_key.encode(buffer)?;
        self.api_version.encode(buffer)?;
        self.correlation_id.encode(buffer)?;
        self.client_id.encode(buffer)?;
        Ok(())
    }
}

/// Run a body parser over a response body, logging the same way for
/// every message type.
pub(crate) fn parse_body<T, F>(name: &str, s: Bytes, parser: F) -> Result<T>
where
    T: Debug,
    F: FnOnce(NomBytes) -> IResult<NomBytes, T>,
{
    tracing::trace!("Parsing {} {:?}", name, s);
    let (_, parsed) = parser(NomBytes::new(s.clone())).map_err(|err| {
        tracing::error!("ERROR: Failed parsing {} {:?}", name, err);
        tracing::error!("ERROR: {} Bytes {:?}", name, s);
        Error::Parsing(name.to_owned())
    })?;
    tracing::trace!("Parsed {} {:?}", name, parsed);
    Ok(parsed)
}

/// Serialize a request body on its own, without a header.
pub fn encode_body<R: ToByte + Debug + ?Sized>(request: &R) -> Result<Bytes> {
    let mut buffer = Vec::with_capacity(64);
    request.encode(&mut buffer)?;
    Ok(Bytes::from(buffer))
}
