//! Encoding and creation for SaslHandshake requests.
//!
//! ### Protocol Def
//! ```text
//! SaslHandshake Request (Version: 1) => mechanism
//!   mechanism => STRING
//! ```
//!
//! Version 1 means the token exchange that follows is carried in
//! `SaslAuthenticate` requests rather than as raw frames.

use bytes::BufMut;

use crate::{
    encode::ToByte,
    error::Result,
    protocol::{ApiKey, KafkaRequest, SaslHandshakeResponse},
};

#[derive(Debug, Clone)]
pub struct SaslHandshakeRequest {
    pub mechanism: String,
}

impl SaslHandshakeRequest {
    pub fn new(mechanism: &str) -> Self {
        Self {
            mechanism: mechanism.to_owned(),
        }
    }
}

impl KafkaRequest for SaslHandshakeRequest {
    const API_KEY: ApiKey = ApiKey::SaslHandshake;
    const API_VERSION: i16 = 1;
    type Response = SaslHandshakeResponse;
}

impl ToByte for SaslHandshakeRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding SaslHandshakeRequest {:?}", self);
        self.mechanism.encode(buffer)
    }
}
