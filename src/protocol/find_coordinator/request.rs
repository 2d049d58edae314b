//! Encoding and creation for FindCoordinator requests.
//!
//! Offsets and membership of a group are owned by one broker, the group
//! coordinator. Any broker can say which one it is.
//!
//! ### Protocol Def
//! ```text
//! FindCoordinator Request (Version: 0) => key
//!   key => STRING
//! ```

use bytes::BufMut;

use crate::{
    encode::ToByte,
    error::Result,
    protocol::{ApiKey, FindCoordinatorResponse, KafkaRequest},
};

#[derive(Debug, Clone)]
pub struct FindCoordinatorRequest {
    /// The group id.
    pub key: String,
}

impl FindCoordinatorRequest {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_owned(),
        }
    }
}

impl KafkaRequest for FindCoordinatorRequest {
    const API_KEY: ApiKey = ApiKey::FindCoordinator;
    const API_VERSION: i16 = 0;
    type Response = FindCoordinatorResponse;
}

impl ToByte for FindCoordinatorRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding FindCoordinatorRequest {:?}", self);
        self.key.encode(buffer)
    }
}
