use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::{env_parse, env_var, ClientConfig},
    consumer::{AutoOffsetReset, Consumer, FetchSettings, NoopListener, RebalanceListener},
    consumer_group::{GroupMembership, GroupSettings},
    error::{Error, Result},
    metadata::ClusterMetadata,
};

pub const DEFAULT_GROUP_ID: &str = "kafka-utility-group";
const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 3_000;
const DEFAULT_MAX_POLL_RECORDS: usize = 500;

/// Configure a group [`Consumer`].
///
/// ### Example
/// ```ignore
/// let config = kerbka::prelude::ClientConfig::from_servers("127.0.0.1:9092", Default::default())?;
/// let consumer = kerbka::prelude::ConsumerBuilder::new(config, "my-group", vec!["my-topic".to_owned()])
///     .auto_offset_reset(kerbka::prelude::AutoOffsetReset::Latest)
///     .session_timeout(std::time::Duration::from_secs(10))
///     .build()
///     .await?;
/// ```
#[derive(Clone)]
pub struct ConsumerBuilder {
    config: ClientConfig,
    topics: Vec<String>,
    group: GroupSettings,
    rebalance_timeout: Option<Duration>,
    fetch: FetchSettings,
    listener: Arc<dyn RebalanceListener>,
}

impl ConsumerBuilder {
    /// Start a consumer builder. To complete, use the [`build`](Self::build) method.
    pub fn new(config: ClientConfig, group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            config,
            topics,
            group: GroupSettings {
                group_id: group_id.into(),
                session_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS),
                rebalance_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS),
                heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            },
            rebalance_timeout: None,
            fetch: FetchSettings {
                max_poll_records: DEFAULT_MAX_POLL_RECORDS,
                ..FetchSettings::default()
            },
            listener: Arc::new(NoopListener),
        }
    }

    /// Start from [`ClientConfig::from_env`] and the consumer variables:
    /// `KAFKA_CONSUMER_GROUP_ID`, `KAFKA_AUTO_OFFSET_RESET`,
    /// `KAFKA_MAX_POLL_RECORDS`, `KAFKA_SESSION_TIMEOUT_MS` and
    /// `KAFKA_HEARTBEAT_INTERVAL_MS`.
    pub fn from_env(topics: Vec<String>) -> Result<Self> {
        let config = ClientConfig::from_env()?;
        let group_id = env_var("KAFKA_CONSUMER_GROUP_ID").unwrap_or_else(|| DEFAULT_GROUP_ID.to_owned());
        Ok(Self::new(config, group_id, topics)
            .auto_offset_reset(env_parse("KAFKA_AUTO_OFFSET_RESET", AutoOffsetReset::Earliest)?)
            .max_poll_records(env_parse("KAFKA_MAX_POLL_RECORDS", DEFAULT_MAX_POLL_RECORDS)?)
            .session_timeout(Duration::from_millis(env_parse(
                "KAFKA_SESSION_TIMEOUT_MS",
                DEFAULT_SESSION_TIMEOUT_MS,
            )?))
            .heartbeat_interval(Duration::from_millis(env_parse(
                "KAFKA_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )?)))
    }

    /// How long the coordinator waits for a heartbeat before evicting the member.
    pub fn session_timeout(mut self, session_timeout: Duration) -> Self {
        self.group.session_timeout = session_timeout;
        self
    }

    /// How long the coordinator waits for members to rejoin during a
    /// rebalance. Defaults to the session timeout.
    pub fn rebalance_timeout(mut self, rebalance_timeout: Duration) -> Self {
        self.rebalance_timeout = Some(rebalance_timeout);
        self
    }

    pub fn heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.group.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn auto_offset_reset(mut self, auto_offset_reset: AutoOffsetReset) -> Self {
        self.fetch.auto_offset_reset = auto_offset_reset;
        self
    }

    /// Records per poll of [`Consumer::into_stream`].
    pub fn max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.fetch.max_poll_records = max_poll_records;
        self
    }

    /// The longest a single fetch waits for data on the broker.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.fetch.max_wait = max_wait;
        self
    }

    pub fn min_bytes(mut self, min_bytes: i32) -> Self {
        self.fetch.min_bytes = min_bytes;
        self
    }

    pub fn max_bytes(mut self, max_bytes: i32) -> Self {
        self.fetch.max_bytes = max_bytes;
        self
    }

    pub fn max_partition_bytes(mut self, max_partition_bytes: i32) -> Self {
        self.fetch.max_partition_bytes = max_partition_bytes;
        self
    }

    /// Hooks to run when partitions are revoked and assigned.
    pub fn listener(mut self, listener: impl RebalanceListener + 'static) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.topics.is_empty() {
            return Err(Error::Config("a consumer needs at least one topic".to_owned()));
        }
        if self.group.group_id.is_empty() {
            return Err(Error::Config("group id is empty".to_owned()));
        }
        if self.group.heartbeat_interval >= self.group.session_timeout {
            return Err(Error::Config(format!(
                "heartbeat interval {:?} must be below the session timeout {:?}",
                self.group.heartbeat_interval, self.group.session_timeout
            )));
        }
        Ok(())
    }

    /// Load cluster metadata for the topics. The group is joined on the
    /// first poll.
    pub async fn build(self) -> Result<Consumer> {
        self.validate()?;
        let mut group = self.group;
        group.rebalance_timeout = self.rebalance_timeout.unwrap_or(group.session_timeout);
        let metadata = ClusterMetadata::bootstrap(self.config, self.topics.clone()).await?;
        let membership = GroupMembership::new(group, self.topics);
        Ok(Consumer::new(metadata, membership, self.fetch, self.listener))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SecurityProtocol;

    fn config() -> ClientConfig {
        ClientConfig::from_servers("localhost:9092", SecurityProtocol::Plaintext).unwrap()
    }

    #[test]
    fn defaults() {
        let builder = ConsumerBuilder::new(config(), DEFAULT_GROUP_ID, vec!["t".to_owned()]);
        assert_eq!(builder.group.session_timeout, Duration::from_secs(30));
        assert_eq!(builder.group.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(builder.fetch.max_poll_records, 500);
        assert_eq!(builder.fetch.auto_offset_reset, AutoOffsetReset::Earliest);
        builder.validate().unwrap();
    }

    #[test]
    fn invalid_settings() {
        let no_topics = ConsumerBuilder::new(config(), "g", vec![]);
        assert!(matches!(no_topics.validate(), Err(Error::Config(_))));

        let slow_heartbeat = ConsumerBuilder::new(config(), "g", vec!["t".to_owned()])
            .session_timeout(Duration::from_secs(5))
            .heartbeat_interval(Duration::from_secs(5));
        assert!(matches!(slow_heartbeat.validate(), Err(Error::Config(_))));
    }
}
