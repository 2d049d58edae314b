//! Record batches (message format v2).
//!
//! ```text
//! RecordBatch =>
//!   baseOffset: int64
//!   batchLength: int32          bytes that follow this field
//!   partitionLeaderEpoch: int32
//!   magic: int8                 always 2
//!   crc: uint32                 CRC-32C of everything after this field
//!   attributes: int16           bits 0~2 compression, bit 4 transactional, bit 5 control
//!   lastOffsetDelta: int32
//!   baseTimestamp: int64
//!   maxTimestamp: int64
//!   producerId: int64
//!   producerEpoch: int16
//!   baseSequence: int32
//!   records: [Record]           int32 count, then the (possibly compressed) records
//!
//! Record =>
//!   length: varint
//!   attributes: int8
//!   timestampDelta: varlong
//!   offsetDelta: varint
//!   key: varint length + bytes, -1 for null
//!   value: varint length + bytes, -1 for null
//!   headers: varint count of (key, value)
//! ```
use bytes::{BufMut, Bytes};
use nom::{
    bytes::complete::take,
    error::ErrorKind,
    number::complete::{be_i16, be_i32, be_i64, be_i8, be_u32},
    IResult,
};
use nombytes::NomBytes;
use serde_derive::{Deserialize, Serialize};

use crate::{
    encode::{backfill_i32, put_varint, put_varint_bytes, varint_len, ToByte},
    error::{Error, Result},
    parser,
    utils::{crc32c, gunzip, gzip},
};

pub const MAGIC: i8 = 2;

const COMPRESSION_MASK: i16 = 0x07;
const TRANSACTIONAL_FLAG: i16 = 0x10;
const CONTROL_FLAG: i16 = 0x20;
// baseOffset and batchLength precede the length-counted region
const BATCH_PREFIX: usize = 8 + 4;
// partitionLeaderEpoch, magic and crc precede the crc-covered region
const CRC_PREFIX: usize = 4 + 1 + 4;
// fixed fields of a batch after batchLength, up to and including the record count
const FIXED_BODY: usize = CRC_PREFIX + 2 + 4 + 8 + 8 + 8 + 2 + 4 + 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    fn attribute_bits(self) -> i16 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: Option<Bytes>,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub offset_delta: i32,
    pub timestamp_delta: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
}

impl Record {
    /// Upper bound on the encoded size of a record, used for batching.
    pub fn estimated_size(key: Option<&[u8]>, value: Option<&[u8]>, headers: &[Header]) -> usize {
        let header_bytes: usize = headers
            .iter()
            .map(|h| h.key.len() + h.value.as_ref().map_or(0, |v| v.len()) + 10)
            .sum();
        key.map_or(0, <[u8]>::len) + value.map_or(0, <[u8]>::len) + header_bytes + 21
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(
            Self::estimated_size(self.key.as_deref(), self.value.as_deref(), &self.headers),
        );
        body.put_i8(0);
        put_varint(&mut body, self.timestamp_delta);
        put_varint(&mut body, i64::from(self.offset_delta));
        put_varint_bytes(&mut body, self.key.as_deref());
        put_varint_bytes(&mut body, self.value.as_deref());
        put_varint(&mut body, self.headers.len() as i64);
        for header in &self.headers {
            put_varint_bytes(&mut body, Some(header.key.as_bytes()));
            put_varint_bytes(&mut body, header.value.as_deref());
        }
        out.reserve(varint_len(body.len() as i64) + body.len());
        put_varint(out, body.len() as i64);
        out.extend_from_slice(&body);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub attributes: i16,
    pub last_offset_delta: i32,
    pub base_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// A non-transactional, non-idempotent batch as a plain producer sends it.
    pub fn new(base_timestamp: i64, records: Vec<Record>, compression: Compression) -> Self {
        let last_offset_delta = records.last().map_or(0, |r| r.offset_delta);
        let max_timestamp = records
            .iter()
            .map(|r| base_timestamp + r.timestamp_delta)
            .max()
            .unwrap_or(base_timestamp);
        Self {
            base_offset: 0,
            partition_leader_epoch: -1,
            attributes: compression.attribute_bits(),
            last_offset_delta,
            base_timestamp,
            max_timestamp,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records,
        }
    }

    pub fn compression(&self) -> std::result::Result<Compression, i16> {
        match self.attributes & COMPRESSION_MASK {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            other => Err(other),
        }
    }

    pub fn is_control(&self) -> bool {
        self.attributes & CONTROL_FLAG != 0
    }

    pub fn is_transactional(&self) -> bool {
        self.attributes & TRANSACTIONAL_FLAG != 0
    }

    pub fn last_offset(&self) -> i64 {
        self.base_offset + i64::from(self.last_offset_delta)
    }
}

impl ToByte for RecordBatch {
    fn encode<W: BufMut>(&self, out: &mut W) -> Result<()> {
        let compression = self.compression().map_err(|bits| {
            Error::Encoding(format!("unsupported compression attribute {}", bits))
        })?;

        let mut records = Vec::with_capacity(self.records.len() * 32);
        for record in &self.records {
            record.encode_into(&mut records);
        }
        if compression == Compression::Gzip {
            records = gzip(&records).map_err(|err| Error::Encoding(err.to_string()))?;
        }

        let mut buffer: Vec<u8> = Vec::with_capacity(BATCH_PREFIX + FIXED_BODY + records.len());
        self.base_offset.encode(&mut buffer)?;
        0i32.encode(&mut buffer)?; // batch length, filled in below
        self.partition_leader_epoch.encode(&mut buffer)?;
        MAGIC.encode(&mut buffer)?;
        let crc_pos = buffer.len();
        0i32.encode(&mut buffer)?;
        self.attributes.encode(&mut buffer)?;
        self.last_offset_delta.encode(&mut buffer)?;
        self.base_timestamp.encode(&mut buffer)?;
        self.max_timestamp.encode(&mut buffer)?;
        self.producer_id.encode(&mut buffer)?;
        self.producer_epoch.encode(&mut buffer)?;
        self.base_sequence.encode(&mut buffer)?;
        let count = i32::try_from(self.records.len())
            .map_err(|_| Error::Encoding("too many records in batch".to_owned()))?;
        count.encode(&mut buffer)?;
        buffer.extend_from_slice(&records);

        let crc = crc32c(&buffer[crc_pos + 4..]);
        backfill_i32(&mut buffer, crc_pos, crc as i32)?;
        let batch_length = i32::try_from(buffer.len() - BATCH_PREFIX)
            .map_err(|_| Error::Encoding("record batch overflows i32".to_owned()))?;
        backfill_i32(&mut buffer, 8, batch_length)?;

        out.put_slice(&buffer);
        Ok(())
    }
}

/// Encode batches back to back, as a partition's `records` field expects.
pub fn encode_record_set(batches: &[RecordBatch]) -> Result<Bytes> {
    let mut buffer = Vec::new();
    for batch in batches {
        batch.encode(&mut buffer)?;
    }
    Ok(Bytes::from(buffer))
}

fn fail<T>(s: NomBytes, kind: ErrorKind) -> IResult<NomBytes, T> {
    Err(nom::Err::Failure(nom::error::Error::new(s, kind)))
}

/// Parse every complete batch in a partition's record set.
///
/// Brokers cut the record set at `max_bytes`, so the final batch may be
/// truncated; it is dropped and will be fetched again from its base offset.
pub fn parse_record_set(s: NomBytes) -> IResult<NomBytes, Vec<RecordBatch>> {
    let mut batches = vec![];
    let mut rest = s;
    loop {
        let available = rest.to_bytes();
        if available.len() < BATCH_PREFIX {
            break;
        }
        let declared = i32::from_be_bytes([available[8], available[9], available[10], available[11]]);
        if declared < 0 || available.len() < BATCH_PREFIX + declared as usize {
            break;
        }
        let (next, batch) = parse_record_batch(rest)?;
        rest = next;
        batches.push(batch);
    }
    Ok((rest, batches))
}

pub fn parse_record_batch(s: NomBytes) -> IResult<NomBytes, RecordBatch> {
    let (s, base_offset) = be_i64(s)?;
    let (s, batch_length) = be_i32(s)?;
    if batch_length < FIXED_BODY as i32 {
        return fail(s, ErrorKind::LengthValue);
    }
    let (s, body) = take(batch_length as u32)(s)?;
    let (_, batch) = parse_batch_body(base_offset, body)?;
    Ok((s, batch))
}

fn parse_batch_body(base_offset: i64, body: NomBytes) -> IResult<NomBytes, RecordBatch> {
    let raw = body.to_bytes();
    let (s, partition_leader_epoch) = be_i32(body)?;
    let (s, magic) = be_i8(s)?;
    if magic != MAGIC {
        return fail(s, ErrorKind::Tag);
    }
    let (s, crc) = be_u32(s)?;
    if crc32c(&raw[CRC_PREFIX..]) != crc {
        tracing::error!("ERROR: record batch at offset {} failed its CRC", base_offset);
        return fail(s, ErrorKind::Verify);
    }
    let (s, attributes) = be_i16(s)?;
    let (s, last_offset_delta) = be_i32(s)?;
    let (s, base_timestamp) = be_i64(s)?;
    let (s, max_timestamp) = be_i64(s)?;
    let (s, producer_id) = be_i64(s)?;
    let (s, producer_epoch) = be_i16(s)?;
    let (s, base_sequence) = be_i32(s)?;
    let (s, record_count) = be_i32(s)?;

    let mut batch = RecordBatch {
        base_offset,
        partition_leader_epoch,
        attributes,
        last_offset_delta,
        base_timestamp,
        max_timestamp,
        producer_id,
        producer_epoch,
        base_sequence,
        records: vec![],
    };

    // When compression is enabled, the batch header stays
    // uncompressed, but the records are compressed together
    let records = match batch.compression() {
        Ok(Compression::None) => s.clone(),
        Ok(Compression::Gzip) => {
            tracing::debug!("Decompressing with GZIP");
            match gunzip(s.to_bytes().as_ref()) {
                Ok(plain) => NomBytes::new(Bytes::from(plain)),
                Err(_) => return fail(s, ErrorKind::Verify),
            }
        }
        Err(_) => return fail(s, ErrorKind::Switch),
    };

    let mut input = records;
    for _ in 0..record_count.max(0) {
        let (rest, record) = parse_record(input)?;
        input = rest;
        batch.records.push(record);
    }

    Ok((NomBytes::new(Bytes::new()), batch))
}

fn parse_record(s: NomBytes) -> IResult<NomBytes, Record> {
    let (s, length) = parser::parse_varint(s)?;
    if length < 0 {
        return fail(s, ErrorKind::LengthValue);
    }
    let (s, body) = take(length as usize)(s)?;
    let (r, _attributes) = be_i8(body)?;
    let (r, timestamp_delta) = parser::parse_varint(r)?;
    let (r, offset_delta) = parser::parse_varint(r)?;
    let (r, key) = parser::parse_varint_bytes(r)?;
    let (r, value) = parser::parse_varint_bytes(r)?;
    let (mut r, header_count) = parser::parse_varint(r)?;

    let mut headers = Vec::with_capacity((header_count.max(0) as usize).min(64));
    for _ in 0..header_count.max(0) {
        let (rest, key) = parser::parse_varint_bytes(r)?;
        let (rest, value) = parser::parse_varint_bytes(rest)?;
        r = rest;
        let key = match key.map(|k| String::from_utf8(k.to_vec())) {
            Some(Ok(key)) => key,
            _ => return fail(r, ErrorKind::Char),
        };
        headers.push(Header { key, value });
    }

    Ok((
        s,
        Record {
            offset_delta: offset_delta as i32,
            timestamp_delta,
            key,
            value,
            headers,
        },
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    fn records() -> Vec<Record> {
        vec![
            Record {
                offset_delta: 0,
                timestamp_delta: 0,
                key: Some(Bytes::from_static(b"user-1")),
                value: Some(Bytes::from_static(b"{\"n\":1}")),
                headers: vec![Header::new("trace", Bytes::from_static(b"abc"))],
            },
            Record {
                offset_delta: 1,
                timestamp_delta: 5,
                key: None,
                value: None,
                headers: vec![],
            },
        ]
    }

    #[test]
    fn batch_header_fields() {
        let batch = RecordBatch::new(1_700_000_000_000, records(), Compression::None);
        let mut buf = Vec::new();
        batch.encode(&mut buf).unwrap();

        let length = i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(length as usize, buf.len() - BATCH_PREFIX);
        assert_eq!(buf[16], MAGIC as u8);
        let crc = u32::from_be_bytes([buf[17], buf[18], buf[19], buf[20]]);
        assert_eq!(crc, crc32c(&buf[21..]));
    }

    #[test]
    fn parse_encoded_batch() {
        let mut batch = RecordBatch::new(1_700_000_000_000, records(), Compression::None);
        batch.base_offset = 40;
        let mut buf = Vec::new();
        batch.encode(&mut buf).unwrap();

        let (_, parsed) = parse_record_batch(NomBytes::new(Bytes::from(buf))).unwrap();
        assert_eq!(parsed, batch);
        assert_eq!(parsed.last_offset(), 41);
        assert_eq!(parsed.max_timestamp, 1_700_000_000_005);
    }

    #[test]
    fn gzip_batches_decompress() {
        let batch = RecordBatch::new(10, records(), Compression::Gzip);
        let mut buf = Vec::new();
        batch.encode(&mut buf).unwrap();

        let (_, parsed) = parse_record_batch(NomBytes::new(Bytes::from(buf))).unwrap();
        assert_eq!(parsed.compression(), Ok(Compression::Gzip));
        assert_eq!(parsed.records, records());
    }

    #[test]
    fn corrupted_batch_is_rejected() {
        let batch = RecordBatch::new(10, records(), Compression::None);
        let mut buf = Vec::new();
        batch.encode(&mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        assert!(parse_record_batch(NomBytes::new(Bytes::from(buf))).is_err());
    }

    #[test]
    fn truncated_trailing_batch_is_dropped() {
        let first = RecordBatch::new(10, records(), Compression::None);
        let mut second = first.clone();
        second.base_offset = 2;
        let set = encode_record_set(&[first.clone(), second]).unwrap();
        let cut = set.slice(..set.len() - 7);

        let (_, batches) = parse_record_set(NomBytes::new(cut)).unwrap();
        assert_eq!(batches, vec![first]);
    }
}
