//! Client that sends records to a cluster.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_derive::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinHandle, JoinSet},
    time::{sleep, sleep_until, Instant},
};
use tracing::instrument;

use crate::{
    error::{Error, KafkaCode, Result},
    metadata::{ClusterMetadata, TopicPartition},
    network::Connection,
    partitioner::Partitioner,
    protocol::{records::encode_record_set, Compression, Header, ProduceRequest, Record, RecordBatch},
    utils,
};

/// How many replicas must have a batch before the broker acknowledges it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire and forget. The broker sends no response.
    None,
    #[default]
    Leader,
    /// Every in-sync replica.
    All,
}

impl Acks {
    pub fn as_i16(&self) -> i16 {
        match self {
            Acks::None => 0,
            Acks::Leader => 1,
            Acks::All => -1,
        }
    }
}

/// Common produce message format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProduceMessage {
    pub topic: String,
    /// Explicit partition; otherwise chosen from the key.
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
}

impl ProduceMessage {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: Some(value.into()),
            headers: vec![],
        }
    }

    /// A message whose value is `value` serialized as JSON.
    pub fn json<T: Serialize + ?Sized>(topic: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(topic, serde_json::to_vec(value)?))
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }
}

/// Where an acknowledged record was written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    /// Unknown when produced with [`Acks::None`].
    pub offset: Option<i64>,
}

/// Resolves once the record it was returned for is acknowledged or has
/// failed for good.
#[derive(Debug)]
pub struct DeliveryHandle {
    receiver: oneshot::Receiver<Result<RecordMetadata>>,
}

impl DeliveryHandle {
    pub async fn wait(self) -> Result<RecordMetadata> {
        self.receiver.await.map_err(|_| Error::ClientClosed)?
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ProducerSettings {
    pub acks: Acks,
    pub timeout_ms: i32,
    pub max_batch_bytes: usize,
    pub linger: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    pub compression: Compression,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            acks: Acks::Leader,
            timeout_ms: 30_000,
            max_batch_bytes: 16 * 1024,
            linger: Duration::from_millis(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(1),
            compression: Compression::None,
        }
    }
}

impl ProducerSettings {
    /// Delay before retry number `attempt`, counting from 1.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.retry_backoff_max)
    }
}

pub(crate) enum Command {
    Send(ProduceMessage, oneshot::Sender<Result<RecordMetadata>>),
    Flush(oneshot::Sender<()>),
}

/// Kafka Producer.
///
/// This struct is a handle to a background worker that does the actual
/// producing. The worker collects incoming messages into one batch per
/// partition. A batch is sent once it reaches the configured size in
/// bytes, once it has waited for the linger time, or on
/// [`flush`](Self::flush). The two parameters found in the
/// [`ProducerBuilder`](crate::prelude::ProducerBuilder) help dial in
/// latency and throughput.
///
/// At most one batch per partition is in flight, and a failed batch is
/// retried before anything after it is sent, so records with the same key
/// are written in the order they were submitted.
///
/// ### Example
/// ```ignore
/// let config = kerbka::prelude::ClientConfig::from_env()?;
/// let producer = kerbka::prelude::ProducerBuilder::new(config)
///     .linger(std::time::Duration::from_millis(10))
///     .build()
///     .await?;
///
/// let message = kerbka::prelude::ProduceMessage::new("my-topic", "Value").with_key("Tester");
/// let metadata = producer.send(message).await?;
/// producer.close().await?;
/// ```
#[derive(Debug)]
pub struct Producer {
    commands: mpsc::Sender<Command>,
    worker: JoinHandle<()>,
}

impl Producer {
    pub(crate) fn spawn(metadata: ClusterMetadata, settings: ProducerSettings, queue: usize) -> Self {
        let (commands, receiver) = mpsc::channel(queue.max(1));
        let worker = Worker {
            metadata,
            settings,
            partitioner: Partitioner::new(),
            batches: BTreeMap::new(),
        };
        Producer {
            commands,
            worker: tokio::spawn(worker.run(receiver)),
        }
    }

    /// Submit `message` without waiting for its acknowledgment.
    pub async fn enqueue(&self, message: ProduceMessage) -> Result<DeliveryHandle> {
        let (delivery, receiver) = oneshot::channel();
        self.commands
            .send(Command::Send(message, delivery))
            .await
            .map_err(|_| Error::ClientClosed)?;
        Ok(DeliveryHandle { receiver })
    }

    /// Submit `message` and wait for its acknowledgment.
    pub async fn send(&self, message: ProduceMessage) -> Result<RecordMetadata> {
        self.enqueue(message).await?.wait().await
    }

    /// Send every buffered batch and wait until each has an outcome.
    pub async fn flush(&self) -> Result<()> {
        let (done, receiver) = oneshot::channel();
        self.commands
            .send(Command::Flush(done))
            .await
            .map_err(|_| Error::ClientClosed)?;
        receiver.await.map_err(|_| Error::ClientClosed)
    }

    /// Flush, then stop the worker and close its connections.
    pub async fn close(self) -> Result<()> {
        let Producer { commands, worker } = self;
        drop(commands);
        worker.await.map_err(|err| {
            tracing::error!("ERROR: Producer worker ended abnormally {:?}", err);
            Error::ClientClosed
        })
    }
}

struct PendingRecord {
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Vec<Header>,
    timestamp: i64,
    delivery: oneshot::Sender<Result<RecordMetadata>>,
}

struct PendingBatch {
    records: Vec<PendingRecord>,
    size: usize,
    created: Instant,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            records: vec![],
            size: 0,
            created: Instant::now(),
        }
    }

    fn encode(&self, compression: Compression) -> Result<Bytes> {
        let base_timestamp = self.records.first().map_or_else(utils::now, |r| r.timestamp);
        let records = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| Record {
                offset_delta: i as i32,
                timestamp_delta: r.timestamp - base_timestamp,
                key: r.key.clone(),
                value: r.value.clone(),
                headers: r.headers.clone(),
            })
            .collect();
        encode_record_set(&[RecordBatch::new(base_timestamp, records, compression)])
    }

    fn complete(self, tp: &TopicPartition, base_offset: Option<i64>) {
        for (i, record) in self.records.into_iter().enumerate() {
            let _ = record.delivery.send(Ok(RecordMetadata {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: base_offset.map(|base| base + i as i64),
            }));
        }
    }

    fn fail(self, err: Error) {
        for record in self.records {
            let _ = record.delivery.send(Err(err.clone()));
        }
    }
}

enum Outcome {
    Done,
    Retry(TopicPartition, PendingBatch, Error),
}

struct Worker {
    metadata: ClusterMetadata,
    settings: ProducerSettings,
    partitioner: Partitioner,
    batches: BTreeMap<TopicPartition, PendingBatch>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let deadline = self
                .batches
                .values()
                .map(|b| b.created + self.settings.linger)
                .min();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send(message, delivery)) => self.accept(message, delivery).await,
                    Some(Command::Flush(done)) => {
                        self.deliver(true).await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.deliver(false).await
                }
            }
        }
        self.deliver(true).await;
        self.metadata.close();
        tracing::debug!("Producer worker stopped");
    }

    async fn accept(&mut self, message: ProduceMessage, delivery: oneshot::Sender<Result<RecordMetadata>>) {
        let partition = match self.route(&message).await {
            Ok(partition) => partition,
            Err(err) => {
                tracing::warn!("Cannot route message for {}: {}", message.topic, err);
                let _ = delivery.send(Err(err));
                return;
            }
        };
        let size = Record::estimated_size(
            message.key.as_deref(),
            message.value.as_deref(),
            &message.headers,
        );
        let tp = TopicPartition::new(message.topic, partition);
        let batch = self.batches.entry(tp).or_insert_with(PendingBatch::new);
        batch.size += size;
        batch.records.push(PendingRecord {
            key: message.key,
            value: message.value,
            headers: message.headers,
            timestamp: utils::now(),
            delivery,
        });
        if batch.size >= self.settings.max_batch_bytes {
            self.deliver(false).await;
        }
    }

    async fn route(&mut self, message: &ProduceMessage) -> Result<i32> {
        self.metadata.ensure_topic(&message.topic).await?;
        let count = self.metadata.partition_count(&message.topic).unwrap_or(0);
        self.partitioner.partition(
            &message.topic,
            message.key.as_deref(),
            message.partition,
            count,
        )
    }

    /// Send every batch that is due, or all of them when `force` is set,
    /// retrying transient failures until each batch has an outcome.
    #[instrument(name = "producer-deliver", level = "debug", skip(self))]
    async fn deliver(&mut self, force: bool) {
        let now = Instant::now();
        let settings = &self.settings;
        let due: Vec<TopicPartition> = self
            .batches
            .iter()
            .filter(|(_, b)| {
                force || b.size >= settings.max_batch_bytes || now >= b.created + settings.linger
            })
            .map(|(tp, _)| tp.clone())
            .collect();
        let mut batches: Vec<(TopicPartition, PendingBatch)> = due
            .into_iter()
            .filter_map(|tp| self.batches.remove(&tp).map(|b| (tp, b)))
            .collect();

        let mut attempt = 0;
        while !batches.is_empty() {
            let failed = self.attempt(batches).await;
            if failed.is_empty() {
                return;
            }
            attempt += 1;

            let mut refresh = false;
            batches = Vec::with_capacity(failed.len());
            for (tp, batch, err) in failed {
                if !err.is_retriable() || attempt > self.settings.max_retries {
                    tracing::warn!("Giving up on batch for {} after {} attempts: {}", tp, attempt, err);
                    batch.fail(err);
                    continue;
                }
                refresh |= needs_refresh(&err);
                batches.push((tp, batch));
            }
            if batches.is_empty() {
                return;
            }

            let backoff = self.settings.backoff(attempt);
            tracing::warn!(
                "Retrying {} batches in {:?} (attempt {} of {})",
                batches.len(),
                backoff,
                attempt,
                self.settings.max_retries
            );
            sleep(backoff).await;
            if refresh {
                if let Err(err) = self.metadata.refresh().await {
                    tracing::warn!("Metadata refresh before retry failed: {}", err);
                }
            }
        }
    }

    /// One round: every batch goes to its leader, brokers in parallel.
    async fn attempt(
        &mut self,
        batches: Vec<(TopicPartition, PendingBatch)>,
    ) -> Vec<(TopicPartition, PendingBatch, Error)> {
        let mut failed = vec![];
        let mut by_leader: HashMap<i32, Vec<(TopicPartition, PendingBatch)>> = HashMap::new();
        for (tp, batch) in batches {
            match self.metadata.leader_for(&tp.topic, tp.partition) {
                Ok(leader) => by_leader.entry(leader).or_default().push((tp, batch)),
                Err(err) => failed.push((tp, batch, err)),
            }
        }

        let mut set = JoinSet::new();
        for (leader, batches) in by_leader {
            match self.metadata.broker_connection(leader).await {
                Ok(connection) => {
                    set.spawn(produce(connection, self.settings.clone(), batches));
                }
                Err(err) => {
                    tracing::warn!("No connection to broker {}: {}", leader, err);
                    failed.extend(batches.into_iter().map(|(tp, b)| (tp, b, err.clone())));
                }
            }
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        if let Outcome::Retry(tp, batch, err) = outcome {
                            failed.push((tp, batch, err));
                        }
                    }
                }
                // the batches went down with the task; their handles see ClientClosed
                Err(err) => tracing::error!("ERROR: Produce task failed {:?}", err),
            }
        }
        failed
    }
}

fn needs_refresh(err: &Error) -> bool {
    match err {
        Error::Broker(code) => code.invalidates_metadata(),
        Error::NoLeader { .. } => true,
        other => other.is_connection_fatal(),
    }
}

/// Produce batches to one broker.
///
/// Returns an outcome per batch. Batches that failed for good have already
/// been resolved; the rest are handed back for a retry.
async fn produce(
    connection: Connection,
    settings: ProducerSettings,
    batches: Vec<(TopicPartition, PendingBatch)>,
) -> Vec<Outcome> {
    let mut outcomes = Vec::with_capacity(batches.len());
    let mut request = ProduceRequest::new(settings.acks.as_i16(), settings.timeout_ms);
    let mut sent = Vec::with_capacity(batches.len());
    for (tp, batch) in batches {
        match batch.encode(settings.compression) {
            Ok(records) => {
                request.add(&tp.topic, tp.partition, records);
                sent.push((tp, batch));
            }
            Err(err) => {
                batch.fail(err);
                outcomes.push(Outcome::Done);
            }
        }
    }
    if request.is_empty() {
        return outcomes;
    }
    tracing::debug!(
        "Producing {} batches to {}",
        sent.len(),
        connection.endpoint()
    );

    if settings.acks == Acks::None {
        match connection.send_no_reply(&request) {
            Ok(()) => {
                for (tp, batch) in sent {
                    batch.complete(&tp, None);
                    outcomes.push(Outcome::Done);
                }
            }
            Err(err) => outcomes.extend(sent.into_iter().map(|(tp, b)| retry_or_fail(tp, b, err.clone()))),
        }
        return outcomes;
    }

    let response = match connection.request(&request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!("Produce to {} failed: {}", connection.endpoint(), err);
            outcomes.extend(sent.into_iter().map(|(tp, b)| retry_or_fail(tp, b, err.clone())));
            return outcomes;
        }
    };

    for (tp, batch) in sent {
        let outcome = match response.partition(&tp.topic, tp.partition) {
            Some(p) if p.error_code.is_ok() => {
                batch.complete(&tp, Some(p.base_offset));
                Outcome::Done
            }
            Some(p) => retry_or_fail(tp, batch, Error::Broker(p.error_code)),
            None => retry_or_fail(tp, batch, Error::Broker(KafkaCode::Unknown)),
        };
        outcomes.push(outcome);
    }
    outcomes
}

fn retry_or_fail(tp: TopicPartition, batch: PendingBatch, err: Error) -> Outcome {
    if err.is_retriable() {
        Outcome::Retry(tp, batch, err)
    } else {
        tracing::warn!("Batch for {} failed: {}", tp, err);
        batch.fail(err);
        Outcome::Done
    }
}
