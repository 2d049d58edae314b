//! Partition selection for produced records.
//!
//! Keys are hashed with murmur2 and the Kafka seed, the same way the Java
//! client's default partitioner does, so a key lands on the same partition
//! regardless of which client wrote it.
use std::collections::HashMap;

use murmur2::{murmur2, KAFKA_SEED};

use crate::error::{Error, KafkaCode, Result};

/// murmur2 partition for `key` among `partition_count` partitions, `None`
/// unless the count is positive.
pub fn partition_for_key(key: &[u8], partition_count: i32) -> Option<i32> {
    if partition_count <= 0 {
        return None;
    }
    let hash = murmur2(key, KAFKA_SEED);
    // toPositive(murmur2(key)) % numPartitions
    Some(((hash & 0x7fff_ffff) as i32) % partition_count)
}

/// Picks partitions for records without an explicit one.
///
/// Unkeyed records rotate through the partitions of their topic.
#[derive(Debug, Default)]
pub struct Partitioner {
    counters: HashMap<String, u32>,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(
        &mut self,
        topic: &str,
        key: Option<&[u8]>,
        hint: Option<i32>,
        partition_count: i32,
    ) -> Result<i32> {
        if partition_count <= 0 {
            return Err(Error::Broker(KafkaCode::UnknownTopicOrPartition));
        }
        if let Some(partition) = hint {
            if partition < 0 || partition >= partition_count {
                return Err(Error::Broker(KafkaCode::UnknownTopicOrPartition));
            }
            return Ok(partition);
        }
        match key {
            Some(key) => partition_for_key(key, partition_count)
                .ok_or(Error::Broker(KafkaCode::UnknownTopicOrPartition)),
            None => {
                let counter = self.counters.entry(topic.to_owned()).or_default();
                let partition = (*counter % partition_count as u32) as i32;
                *counter = counter.wrapping_add(1);
                Ok(partition)
            }
        }
    }
}
