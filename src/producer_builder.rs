use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::metadata::ClusterMetadata;
use crate::producer::{Acks, Producer, ProducerSettings};
use crate::protocol::Compression;

const DEFAULT_QUEUE_SIZE: usize = 1024;

/// Configure a [`Producer`].
///
/// ### Example
/// ```ignore
/// let config = kerbka::prelude::ClientConfig::from_servers("127.0.0.1:9092", Default::default())?;
/// let producer = kerbka::prelude::ProducerBuilder::new(config)
///     .acks(kerbka::prelude::Acks::All)
///     .max_batch_bytes(64 * 1024)
///     .linger(std::time::Duration::from_millis(20))
///     .build()
///     .await?;
/// ```
#[derive(Clone, Debug)]
pub struct ProducerBuilder {
    config: ClientConfig,
    topics: Vec<String>,
    settings: ProducerSettings,
    queue_size: usize,
}

impl ProducerBuilder {
    /// Start a producer builder. To complete, use the [`build`](Self::build) method.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            topics: vec![],
            settings: ProducerSettings::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }

    /// Start from [`ClientConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ClientConfig::from_env()?))
    }

    /// Topics to load metadata for up front. Others are looked up on first use.
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    /// The acknowledgment level every produce request asks for.
    pub fn acks(mut self, acks: Acks) -> Self {
        self.settings.acks = acks;
        self
    }

    /// How long the broker may wait for replication before answering, in milliseconds.
    pub fn timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.settings.timeout_ms = timeout_ms;
        self
    }

    /// The size in bytes at which a partition's batch is sent.
    ///
    /// Unless the [`linger`](Self::linger) time has passed first, then the
    /// batch is sent regardless of its size.
    ///
    /// Increasing this number will increase latency, but also increase throughput.
    pub fn max_batch_bytes(mut self, max_batch_bytes: usize) -> Self {
        self.settings.max_batch_bytes = max_batch_bytes;
        self
    }

    /// The maximum time a record will sit in a batch before being sent.
    ///
    /// Decreasing this number will lower latency, but also lower throughput.
    pub fn linger(mut self, linger: Duration) -> Self {
        self.settings.linger = linger;
        self
    }

    /// How many times a batch is retried after a transient failure.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.settings.max_retries = max_retries;
        self
    }

    /// First retry delay; it doubles on every further attempt up to `max`.
    pub fn retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.settings.retry_backoff = initial;
        self.settings.retry_backoff_max = max.max(initial);
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.settings.compression = compression;
        self
    }

    /// How many submitted messages may wait for the worker before
    /// [`Producer::enqueue`] waits too.
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Load cluster metadata and start the background worker.
    pub async fn build(self) -> Result<Producer> {
        let metadata = ClusterMetadata::bootstrap(self.config, self.topics).await?;
        Ok(Producer::spawn(metadata, self.settings, self.queue_size))
    }
}
