//! Length-prefixed frames.
//!
//! Every Kafka message travels as `int32 size | header | body`. Requests
//! carry the full header (API key, API version, correlation ID, client ID),
//! responses only echo the correlation ID.
//!
//! [`FrameDecoder`] reassembles frames from an arbitrary split of the byte
//! stream: feed it whatever the socket produced and it hands back at most
//! one complete frame per call, holding on to the rest.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use nom::{
    number::complete::{be_i16, be_i32},
    IResult,
};
use nombytes::NomBytes;

use crate::{
    encode::{backfill_i32, ToByte},
    error::{Error, Result},
    parser,
    protocol::HeaderRequest,
};

/// 100 MiB, the broker's default `socket.request.max.bytes`.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

const SIZE_PREFIX: usize = 4;
// size prefix, api key, api version
const CORRELATION_ID_OFFSET: usize = SIZE_PREFIX + 2 + 2;

/// Frame a request whose body is anything encodable.
pub fn encode_request<B: ToByte + ?Sized>(
    header: &HeaderRequest,
    body: &B,
    max_frame_size: usize,
) -> Result<BytesMut> {
    let mut buffer = BytesMut::with_capacity(64);
    buffer.put_i32(0);
    header.encode(&mut buffer)?;
    body.encode(&mut buffer)?;
    finish_frame(buffer, max_frame_size)
}

/// Frame an already serialized request body.
pub fn encode(
    api_key: i16,
    api_version: i16,
    correlation_id: i32,
    client_id: &str,
    body: &[u8],
    max_frame_size: usize,
) -> Result<Bytes> {
    let header = HeaderRequest::new(api_key, api_version, correlation_id, client_id);
    let mut buffer = BytesMut::with_capacity(SIZE_PREFIX + 10 + client_id.len() + body.len());
    buffer.put_i32(0);
    header.encode(&mut buffer)?;
    buffer.put_slice(body);
    finish_frame(buffer, max_frame_size).map(BytesMut::freeze)
}

/// Frame a response body. Brokers do this; the client only needs it for
/// tests and tooling that stand in for a broker.
pub fn encode_response(correlation_id: i32, body: &[u8], max_frame_size: usize) -> Result<Bytes> {
    let mut buffer = BytesMut::with_capacity(SIZE_PREFIX + 4 + body.len());
    buffer.put_i32(0);
    buffer.put_i32(correlation_id);
    buffer.put_slice(body);
    finish_frame(buffer, max_frame_size).map(BytesMut::freeze)
}

fn finish_frame(mut buffer: BytesMut, max_frame_size: usize) -> Result<BytesMut> {
    let size = buffer.len() - SIZE_PREFIX;
    if size > max_frame_size {
        return Err(Error::Encoding(format!(
            "frame of {} bytes exceeds the maximum of {}",
            size, max_frame_size
        )));
    }
    let size = i32::try_from(size)
        .map_err(|_| Error::Encoding(format!("frame of {} bytes overflows i32", size)))?;
    backfill_i32(&mut buffer, 0, size)?;
    Ok(buffer)
}

/// Rewrite the correlation ID of an encoded request frame in place.
pub(crate) fn set_correlation_id(frame: &mut [u8], correlation_id: i32) -> Result<()> {
    backfill_i32(frame, CORRELATION_ID_OFFSET, correlation_id)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
    pub body: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseFrame {
    pub correlation_id: i32,
    pub body: Bytes,
}

/// Split a request frame (without its size prefix) into header and body.
pub fn decode_request(frame: Bytes) -> Result<RequestFrame> {
    let (rest, (api_key, api_version, correlation_id, client_id)) =
        parse_request_header(NomBytes::new(frame)).map_err(|err| {
            tracing::error!("ERROR: Failed parsing request header {:?}", err);
            Error::Framing("unparseable request header".to_owned())
        })?;
    Ok(RequestFrame {
        api_key,
        api_version,
        correlation_id,
        client_id: client_id.unwrap_or_default(),
        body: rest.into_bytes(),
    })
}

fn parse_request_header(s: NomBytes) -> IResult<NomBytes, (i16, i16, i32, Option<String>)> {
    let (s, api_key) = be_i16(s)?;
    let (s, api_version) = be_i16(s)?;
    let (s, correlation_id) = be_i32(s)?;
    let (s, client_id) = parser::parse_nullable_str(s)?;
    Ok((s, (api_key, api_version, correlation_id, client_id)))
}

/// Split a response frame (without its size prefix) into correlation ID and body.
pub fn decode_response(mut frame: Bytes) -> Result<ResponseFrame> {
    if frame.len() < 4 {
        return Err(Error::Framing(format!(
            "response frame of {} bytes has no header",
            frame.len()
        )));
    }
    let correlation_id = frame.get_i32();
    Ok(ResponseFrame {
        correlation_id,
        body: frame,
    })
}

/// Incremental frame reassembly.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    /// Append `bytes` and try to produce one frame.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<Bytes>> {
        self.buffer.extend_from_slice(bytes);
        self.decode()
    }

    /// Direct access for socket reads (`read_buf`).
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Produce the next complete frame from what is buffered, if any.
    ///
    /// The returned bytes exclude the size prefix.
    pub fn decode(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < SIZE_PREFIX {
            return Ok(None);
        }
        let size = (&self.buffer[..SIZE_PREFIX]).get_i32();
        if size < 0 {
            return Err(Error::Framing(format!("negative frame length {}", size)));
        }
        let size = size as usize;
        if size > self.max_frame_size {
            return Err(Error::Framing(format!(
                "frame length {} exceeds the maximum of {}",
                size, self.max_frame_size
            )));
        }
        if self.buffer.len() < SIZE_PREFIX + size {
            return Ok(None);
        }
        self.buffer.advance(SIZE_PREFIX);
        Ok(Some(self.buffer.split_to(size).freeze()))
    }

    /// Check that the stream ended on a frame boundary.
    pub fn finish(&self) -> Result<()> {
        match self.buffer.len() {
            0 => Ok(()),
            n if n < SIZE_PREFIX => Err(Error::Framing(format!(
                "stream ended inside a length prefix ({} of {} bytes)",
                n, SIZE_PREFIX
            ))),
            n => Err(Error::Framing(format!(
                "stream ended inside a frame ({} bytes buffered)",
                n
            ))),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
