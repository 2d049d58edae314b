//! Client that consumes records from a cluster as a member of a group.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use tokio::{
    task::JoinSet,
    time::{sleep, timeout_at, Instant},
};
use tokio_stream::Stream;
use tracing::instrument;

use crate::{
    consumer_group::{GroupMembership, MembershipState},
    error::{Error, KafkaCode, Result},
    metadata::{ClusterMetadata, TopicPartition},
    protocol::{
        list_offsets::request::{EARLIEST_TIMESTAMP, LATEST_TIMESTAMP},
        FetchRequest, FetchResponse, Header, ListOffsetsRequest, RecordBatch,
    },
};

/// Next offset to read, per partition.
pub type PartitionOffsets = BTreeMap<TopicPartition, i64>;

/// Common consumed message format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumeMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

impl ConsumeMessage {
    /// Decode the value as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .value
            .as_deref()
            .ok_or_else(|| Error::Json("record has no value".to_owned()))?;
        Ok(serde_json::from_slice(value)?)
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Where to start reading a partition that has no committed offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl AutoOffsetReset {
    fn timestamp(&self) -> i64 {
        match self {
            AutoOffsetReset::Earliest => EARLIEST_TIMESTAMP,
            AutoOffsetReset::Latest => LATEST_TIMESTAMP,
        }
    }
}

impl FromStr for AutoOffsetReset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" | "smallest" => Ok(AutoOffsetReset::Earliest),
            "latest" | "largest" => Ok(AutoOffsetReset::Latest),
            other => Err(Error::Config(format!("unknown offset reset {:?}", other))),
        }
    }
}

/// Hooks run around a rebalance.
///
/// `on_partitions_revoked` runs before the old assignment is dropped, so
/// work tied to it can be finished first. The offsets it returns are
/// committed under the generation that is ending.
#[async_trait]
pub trait RebalanceListener: Send + Sync {
    async fn on_partitions_revoked(&self, _revoked: &[TopicPartition]) -> PartitionOffsets {
        PartitionOffsets::new()
    }

    async fn on_partitions_assigned(&self, _assigned: &[TopicPartition]) {}
}

/// Listener that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl RebalanceListener for NoopListener {}

#[derive(Clone, Debug)]
pub(crate) struct FetchSettings {
    pub max_wait: Duration,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub max_partition_bytes: i32,
    pub isolation_level: i8,
    pub auto_offset_reset: AutoOffsetReset,
    pub max_poll_records: usize,
    pub retry_backoff: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(500),
            min_bytes: 1,
            max_bytes: 50 * 1024 * 1024,
            max_partition_bytes: 1024 * 1024,
            isolation_level: 0,
            auto_offset_reset: AutoOffsetReset::Earliest,
            max_poll_records: 500,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Records of one partition read in one generation.
#[derive(Debug)]
struct Fetched {
    generation: i32,
    tp: TopicPartition,
    records: VecDeque<ConsumeMessage>,
}

#[derive(Debug, Default)]
struct FetchOutcome {
    refresh: bool,
    out_of_range: Vec<TopicPartition>,
}

/// Kafka group consumer.
///
/// The consumer joins its group on the first [`poll`](Self::poll), then
/// fetches from the leaders of its assigned partitions and heartbeats in
/// between. Offsets are committed only when asked to with
/// [`commit`](Self::commit) or [`commit_consumed`](Self::commit_consumed).
///
/// Records fetched in one generation are never handed out after the group
/// has moved on to another.
///
/// ### Example
/// ```ignore
/// let config = kerbka::prelude::ClientConfig::from_env()?;
/// let mut consumer = kerbka::prelude::ConsumerBuilder::new(config, "my-group", vec!["my-topic".to_owned()])
///     .build()
///     .await?;
///
/// loop {
///     let records = consumer.poll(100, std::time::Duration::from_secs(1)).await?;
///     for record in &records {
///         println!("{:?}", record);
///     }
///     consumer.commit_consumed().await?;
/// }
/// ```
pub struct Consumer {
    metadata: ClusterMetadata,
    membership: GroupMembership,
    settings: FetchSettings,
    listener: Arc<dyn RebalanceListener>,
    /// Partitions the application was told it owns.
    owned: BTreeSet<TopicPartition>,
    positions: PartitionOffsets,
    buffer: VecDeque<Fetched>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("group_id", &self.membership.group_id())
            .field("state", &self.membership.state())
            .field("generation_id", &self.membership.generation_id())
            .field("positions", &self.positions)
            .finish()
    }
}

impl Consumer {
    pub(crate) fn new(
        metadata: ClusterMetadata,
        membership: GroupMembership,
        settings: FetchSettings,
        listener: Arc<dyn RebalanceListener>,
    ) -> Self {
        Self {
            metadata,
            membership,
            settings,
            listener,
            owned: BTreeSet::new(),
            positions: PartitionOffsets::new(),
            buffer: VecDeque::new(),
        }
    }

    pub fn state(&self) -> MembershipState {
        self.membership.state()
    }

    pub fn generation_id(&self) -> i32 {
        self.membership.generation_id()
    }

    pub fn member_id(&self) -> &str {
        self.membership.member_id()
    }

    /// Partitions currently owned by this member.
    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.owned.iter().cloned().collect()
    }

    /// The next offset to be returned for `tp`.
    pub fn position(&self, tp: &TopicPartition) -> Option<i64> {
        self.positions.get(tp).copied()
    }

    /// Up to `max_records` records, waiting at most `timeout` for the first.
    ///
    /// An empty result means nothing arrived in time. Joining, heartbeats
    /// and fetches all stop at the timeout and carry on in the next poll.
    /// The rebalance listener is the exception and always runs to the end.
    #[instrument(level = "debug", skip(self), fields(group = %self.membership.group_id()))]
    pub async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<ConsumeMessage>> {
        let deadline = Instant::now() + timeout;
        let max_records = max_records.max(1);
        loop {
            if !self.ensure_active(deadline).await? {
                return Ok(vec![]);
            }
            let records = self.drain(max_records);
            if !records.is_empty() {
                tracing::debug!("Read {} records", records.len());
                return Ok(records);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(vec![]);
            }
            let wait = (deadline - now).min(self.settings.max_wait);
            if timeout_at(deadline, self.fetch(wait)).await.is_err() {
                tracing::trace!("Fetch cut short by the poll timeout");
            }
        }
    }

    /// Join or rejoin as needed, heartbeat when one is due, and look up
    /// positions the assignment still lacks. `false` when `deadline`
    /// passed first.
    async fn ensure_active(&mut self, deadline: Instant) -> Result<bool> {
        if self.membership.state() == MembershipState::Dead {
            return Err(Error::ClientClosed);
        }
        if self.membership.heartbeat_due() {
            match timeout_at(deadline, self.membership.heartbeat()).await {
                Ok(outcome) => outcome?,
                Err(_) => return Ok(false),
            }
        }
        if self.membership.state() == MembershipState::Rebalancing {
            self.revoke().await;
        }
        if self.membership.state() != MembershipState::Stable && !self.rejoin(deadline).await? {
            return Ok(false);
        }
        let missing: Vec<TopicPartition> = self
            .owned
            .iter()
            .filter(|tp| !self.positions.contains_key(*tp))
            .cloned()
            .collect();
        if !missing.is_empty() {
            match timeout_at(deadline, self.initialize_positions(&missing)).await {
                Ok(outcome) => outcome?,
                Err(_) => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Hand the owned partitions back. The listener runs first and its
    /// offsets are committed under the generation that is ending.
    async fn revoke(&mut self) {
        self.buffer.clear();
        if self.owned.is_empty() {
            return;
        }
        let revoked: Vec<TopicPartition> = std::mem::take(&mut self.owned).into_iter().collect();
        let generation_id = self.membership.generation_id();
        tracing::info!(
            "Member {:?} | Revoking {:?} of generation {}",
            self.member_id(),
            revoked,
            generation_id
        );
        let offsets = self.listener.on_partitions_revoked(&revoked).await;
        if !offsets.is_empty() {
            if let Err(err) = self
                .membership
                .commit(&mut self.metadata, generation_id, &offsets)
                .await
            {
                tracing::warn!("Commit of revoked partitions failed: {}", err);
            }
        }
        self.positions.clear();
    }

    /// Take over the assignment of a new generation. Positions are looked
    /// up afterwards, so an assignment whose lookup fails is kept and
    /// retried on the next poll.
    async fn rejoin(&mut self, deadline: Instant) -> Result<bool> {
        self.buffer.clear();
        self.positions.clear();
        match timeout_at(deadline, self.membership.join(&mut self.metadata)).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                tracing::debug!("Join of group {} continues in the next poll", self.membership.group_id());
                return Ok(false);
            }
        }
        let assigned: Vec<TopicPartition> = self.membership.assignment().iter().cloned().collect();
        self.owned = assigned.iter().cloned().collect();
        self.listener.on_partitions_assigned(&assigned).await;
        Ok(true)
    }

    /// Resume from the committed offsets, resetting partitions that have none.
    async fn initialize_positions(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        let committed = self.membership.committed(&mut self.metadata, partitions).await?;
        let mut missing = vec![];
        for tp in partitions {
            match committed.get(tp) {
                Some(offset) => {
                    tracing::debug!("Resuming {} at committed offset {}", tp, offset);
                    self.positions.insert(tp.clone(), *offset);
                }
                None => missing.push(tp.clone()),
            }
        }
        self.reset_offsets(&missing).await
    }

    /// Move `partitions` to the earliest or latest offset.
    async fn reset_offsets(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        let by_leader = self.metadata.group_by_leader(partitions)?;
        let timestamp = self.settings.auto_offset_reset.timestamp();
        for (leader, tps) in by_leader {
            let connection = self.metadata.broker_connection(leader).await?;
            let mut request = ListOffsetsRequest::new();
            for tp in &tps {
                request.add(&tp.topic, tp.partition, timestamp);
            }
            let response = connection.request(&request).await?;
            for tp in tps {
                let offset = response
                    .offset(&tp.topic, tp.partition)
                    .ok_or(Error::Broker(KafkaCode::OffsetNotAvailable))?;
                tracing::debug!(
                    "Resetting {} to {:?} offset {}",
                    tp,
                    self.settings.auto_offset_reset,
                    offset
                );
                self.positions.insert(tp, offset);
            }
        }
        Ok(())
    }

    /// One round of fetches, one request per leader, waiting at most `wait`.
    async fn fetch(&mut self, wait: Duration) -> Result<()> {
        let generation = self.membership.generation_id();
        let partitions: Vec<TopicPartition> = self
            .owned
            .iter()
            .filter(|tp| self.positions.contains_key(*tp))
            .cloned()
            .collect();
        if partitions.is_empty() {
            sleep(wait).await;
            return Ok(());
        }
        let by_leader = match self.metadata.group_by_leader(&partitions) {
            Ok(by_leader) => by_leader,
            Err(err) => {
                tracing::warn!("Fetch postponed: {}", err);
                self.refresh_metadata().await;
                sleep(wait.min(self.settings.retry_backoff)).await;
                return Ok(());
            }
        };

        let max_wait_ms = i32::try_from(wait.as_millis()).unwrap_or(i32::MAX);
        let timeout = wait + self.metadata.config().request_timeout;
        let mut requests = JoinSet::new();
        for (leader, tps) in by_leader {
            let connection = match self.metadata.broker_connection(leader).await {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::warn!("No connection to node {}: {}", leader, err);
                    continue;
                }
            };
            let mut request = FetchRequest::new(
                max_wait_ms,
                self.settings.min_bytes,
                self.settings.max_bytes,
                self.settings.isolation_level,
            );
            for tp in &tps {
                if let Some(offset) = self.positions.get(tp) {
                    request.add(&tp.topic, tp.partition, *offset, self.settings.max_partition_bytes);
                }
            }
            tracing::trace!("Fetching {:?} from node {}", tps, leader);
            requests.spawn(async move {
                let result = match connection.send(&request) {
                    Ok(pending) => pending.response_timeout(timeout).await,
                    Err(err) => Err(err),
                };
                (leader, result)
            });
        }

        let mut outcome = FetchOutcome::default();
        let mut failed = requests.is_empty();
        while let Some(joined) = requests.join_next().await {
            let (leader, result) = match joined {
                Ok(joined) => joined,
                Err(err) => {
                    tracing::error!("Fetch task failed: {}", err);
                    failed = true;
                    continue;
                }
            };
            match result {
                Ok(response) => self.accept_fetch(generation, response, &mut outcome),
                Err(err) => {
                    tracing::warn!("Fetch from node {} failed: {}", leader, err);
                    if err.is_connection_fatal() {
                        self.metadata.invalidate_broker(leader);
                    }
                    outcome.refresh = true;
                    failed = true;
                }
            }
        }

        if !outcome.out_of_range.is_empty() {
            tracing::warn!("Offsets out of range for {:?}", outcome.out_of_range);
            if let Err(err) = self.reset_offsets(&outcome.out_of_range).await {
                tracing::warn!("Offset reset failed: {}", err);
                outcome.refresh = true;
            }
        }
        if outcome.refresh {
            self.refresh_metadata().await;
        }
        if failed {
            sleep(wait.min(self.settings.retry_backoff)).await;
        }
        Ok(())
    }

    async fn refresh_metadata(&mut self) {
        if let Err(err) = self.metadata.refresh().await {
            tracing::warn!("Metadata refresh failed: {}", err);
        }
    }

    /// Buffer the records of a fetch issued in `generation`.
    fn accept_fetch(&mut self, generation: i32, response: FetchResponse, outcome: &mut FetchOutcome) {
        if generation != self.membership.generation_id() {
            tracing::debug!(
                "Discarding fetch response of generation {} in generation {}",
                generation,
                self.membership.generation_id()
            );
            return;
        }
        for topic in response.topics {
            for partition in topic.partitions {
                let tp = TopicPartition::new(topic.name.clone(), partition.partition_index);
                match partition.error_code {
                    KafkaCode::None => {}
                    KafkaCode::OffsetOutOfRange => {
                        outcome.out_of_range.push(tp);
                        continue;
                    }
                    code if code.invalidates_metadata() => {
                        tracing::debug!("Fetch for {} returned {:?}", tp, code);
                        outcome.refresh = true;
                        continue;
                    }
                    code => {
                        tracing::warn!("Fetch for {} returned {:?}", tp, code);
                        continue;
                    }
                }
                let records = messages(&tp, partition.record_batches);
                if !records.is_empty() {
                    self.buffer.push_back(Fetched {
                        generation,
                        tp,
                        records,
                    });
                }
            }
        }
    }

    /// Take up to `max_records` buffered records and advance positions past them.
    ///
    /// Records of another generation or of a partition no longer assigned
    /// are dropped, as are records behind the position.
    fn drain(&mut self, max_records: usize) -> Vec<ConsumeMessage> {
        let mut records = Vec::new();
        while records.len() < max_records {
            let Some(fetched) = self.buffer.front_mut() else {
                break;
            };
            if fetched.generation != self.membership.generation_id()
                || !self.membership.is_assigned(&fetched.tp)
            {
                tracing::debug!(
                    "Discarding {} records of {} from generation {}",
                    fetched.records.len(),
                    fetched.tp,
                    fetched.generation
                );
                self.buffer.pop_front();
                continue;
            }
            let Some(position) = self.positions.get_mut(&fetched.tp) else {
                self.buffer.pop_front();
                continue;
            };
            while records.len() < max_records {
                match fetched.records.pop_front() {
                    Some(record) if record.offset < *position => continue,
                    Some(record) => {
                        *position = record.offset + 1;
                        records.push(record);
                    }
                    None => break,
                }
            }
            if fetched.records.is_empty() {
                self.buffer.pop_front();
            }
        }
        records
    }

    /// Commit `offsets` for the current generation.
    ///
    /// Fails with [`Error::CommitFailed`] when the member is not stable,
    /// when a partition is not assigned to it, or when the coordinator
    /// rejects the generation.
    #[instrument(level = "debug", skip(self, offsets), fields(group = %self.membership.group_id()))]
    pub async fn commit(&mut self, offsets: &PartitionOffsets) -> Result<()> {
        if self.membership.state() != MembershipState::Stable {
            return Err(Error::CommitFailed(format!(
                "group {} is {:?}",
                self.membership.group_id(),
                self.membership.state()
            )));
        }
        if let Some(tp) = offsets.keys().find(|tp| !self.membership.is_assigned(tp)) {
            return Err(Error::CommitFailed(format!(
                "{} is not assigned in generation {}",
                tp,
                self.membership.generation_id()
            )));
        }
        let generation_id = self.membership.generation_id();
        self.membership
            .commit(&mut self.metadata, generation_id, offsets)
            .await
    }

    /// Commit the position of every owned partition.
    pub async fn commit_consumed(&mut self) -> Result<()> {
        let offsets: PartitionOffsets = self
            .positions
            .iter()
            .filter(|(tp, _)| self.owned.contains(*tp))
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect();
        self.commit(&offsets).await
    }

    /// Revoke the assignment, leave the group and drop all connections.
    pub async fn close(&mut self) -> Result<()> {
        if self.membership.state() == MembershipState::Dead {
            return Ok(());
        }
        self.revoke().await;
        let result = self.membership.leave().await;
        self.metadata.close();
        result
    }

    /// Convert the consumer into an asynchronous iterator over non-empty polls.
    ///
    /// The stream ends after the consumer reports it is closed.
    #[must_use = "stream does nothing by itself"]
    pub fn into_stream(mut self, timeout: Duration) -> impl Stream<Item = Result<Vec<ConsumeMessage>>> {
        let max_records = self.settings.max_poll_records;
        async_stream::stream! {
            loop {
                match self.poll(max_records, timeout).await {
                    Ok(records) if records.is_empty() => continue,
                    Ok(records) => yield Ok(records),
                    Err(Error::ClientClosed) => {
                        yield Err(Error::ClientClosed);
                        break;
                    }
                    Err(err) => yield Err(err),
                }
            }
        }
    }
}

/// Flatten fetched batches into messages, skipping control batches.
fn messages(tp: &TopicPartition, batches: Vec<RecordBatch>) -> VecDeque<ConsumeMessage> {
    batches
        .into_iter()
        .filter(|batch| !batch.is_control())
        .flat_map(|batch| {
            let base_offset = batch.base_offset;
            let base_timestamp = batch.base_timestamp;
            let topic = tp.topic.clone();
            let partition = tp.partition;
            batch.records.into_iter().map(move |record| ConsumeMessage {
                topic: topic.clone(),
                partition,
                offset: base_offset + i64::from(record.offset_delta),
                key: record.key,
                value: record.value,
                headers: record.headers,
                timestamp: base_timestamp + record.timestamp_delta,
            })
        })
        .collect()
}
