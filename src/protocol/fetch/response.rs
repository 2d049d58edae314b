//! Parsing and processing for Fetch responses.
//!
//! ### Protocol Def
//! ```text
//! Fetch Response (Version: 4) => throttle_time_ms [responses]
//!   throttle_time_ms => INT32
//!   responses => topic [partitions]
//!     topic => STRING
//!     partitions => partition_index error_code high_watermark last_stable_offset [aborted_transactions] records
//!       partition_index => INT32
//!       error_code => INT16
//!       high_watermark => INT64
//!       last_stable_offset => INT64
//!       aborted_transactions => producer_id first_offset
//!         producer_id => INT64
//!         first_offset => INT64
//!       records => RECORDS
//! ```
//!
//! See [`records`](crate::protocol::records) for the batch layout.

use bytes::Bytes;
use nom::{
    number::complete::{be_i32, be_i64},
    IResult,
};
use nombytes::NomBytes;

use crate::{
    error::{Error, KafkaCode, Result},
    parser,
    protocol::{
        parse_body,
        records::{parse_record_set, RecordBatch},
    },
};

#[derive(Debug, Default, PartialEq)]
pub struct FetchResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<Topic>,
}

impl FetchResponse {
    pub fn record_count(&self) -> usize {
        self.topics.iter().map(Topic::record_count).sum()
    }
}

impl TryFrom<Bytes> for FetchResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        parse_body("FetchResponse", s, parse_fetch_response)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub name: String,
    pub partitions: Vec<Partition>,
}

impl Topic {
    pub fn record_count(&self) -> usize {
        self.partitions.iter().map(Partition::record_count).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    /// `None` unless the request asked for READ_COMMITTED.
    pub aborted_transactions: Option<Vec<AbortedTransaction>>,
    pub record_batches: Vec<RecordBatch>,
}

impl Partition {
    pub fn record_count(&self) -> usize {
        self.record_batches.iter().map(|b| b.records.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortedTransaction {
    pub producer_id: i64,
    pub first_offset: i64,
}

pub fn parse_fetch_response(s: NomBytes) -> IResult<NomBytes, FetchResponse> {
    let (s, throttle_time_ms) = be_i32(s)?;
    let (s, topics) = parser::parse_array(parse_topic)(s)?;
    Ok((
        s,
        FetchResponse {
            throttle_time_ms,
            topics,
        },
    ))
}

fn parse_topic(s: NomBytes) -> IResult<NomBytes, Topic> {
    let (s, name) = parser::parse_str(s)?;
    let (s, partitions) = parser::parse_array(parse_partition)(s)?;
    Ok((s, Topic { name, partitions }))
}

fn parse_partition(s: NomBytes) -> IResult<NomBytes, Partition> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, high_watermark) = be_i64(s)?;
    let (s, last_stable_offset) = be_i64(s)?;
    let (s, aborted_transactions) = parser::parse_nullable_array(parse_aborted_transaction)(s)?;
    let (s, records) = parser::parse_nullable_bytes(s)?;
    let record_batches = match records {
        Some(records) if !records.is_empty() => parse_record_set(NomBytes::new(records))?.1,
        _ => vec![],
    };
    Ok((
        s,
        Partition {
            partition_index,
            error_code,
            high_watermark,
            last_stable_offset,
            aborted_transactions,
            record_batches,
        },
    ))
}

fn parse_aborted_transaction(s: NomBytes) -> IResult<NomBytes, AbortedTransaction> {
    let (s, producer_id) = be_i64(s)?;
    let (s, first_offset) = be_i64(s)?;
    Ok((
        s,
        AbortedTransaction {
            producer_id,
            first_offset,
        },
    ))
}
