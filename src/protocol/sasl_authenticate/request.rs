//! Encoding and creation for SaslAuthenticate requests.
//!
//! ### Protocol Def
//! ```text
//! SaslAuthenticate Request (Version: 1) => auth_bytes
//!   auth_bytes => BYTES
//! ```

use bytes::{BufMut, Bytes};

use crate::{
    encode::ToByte,
    error::Result,
    protocol::{ApiKey, KafkaRequest, SaslAuthenticateResponse},
};

#[derive(Clone)]
pub struct SaslAuthenticateRequest {
    pub auth_bytes: Bytes,
}

impl SaslAuthenticateRequest {
    pub fn new(auth_bytes: Bytes) -> Self {
        Self { auth_bytes }
    }
}

// tokens are credentials, keep them out of the logs
impl std::fmt::Debug for SaslAuthenticateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslAuthenticateRequest")
            .field("auth_bytes", &format_args!("<{} bytes>", self.auth_bytes.len()))
            .finish()
    }
}

impl KafkaRequest for SaslAuthenticateRequest {
    const API_KEY: ApiKey = ApiKey::SaslAuthenticate;
    const API_VERSION: i16 = 1;
    type Response = SaslAuthenticateResponse;
}

impl ToByte for SaslAuthenticateRequest {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        tracing::trace!("Encoding {:?}", self);
        self.auth_bytes.encode(buffer)
    }
}
