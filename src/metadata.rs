//! Cluster metadata & broker connections.
use std::collections::HashMap;
use std::fmt;

use serde_derive::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    config::{BrokerEndpoint, ClientConfig, SecurityProtocol},
    error::{Error, KafkaCode, Result},
    network::Connection,
    protocol::{self, metadata::response::Partition},
};

/// A (topic, partition) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// What the cluster said about its brokers and the tracked topics, plus
/// one connection per broker.
///
/// Every broker is reached over the bootstrap security protocol.
/// Connections that failed, or whose SASL session expired, are replaced
/// the next time they are asked for.
#[derive(Debug)]
pub struct ClusterMetadata {
    config: ClientConfig,
    security_protocol: SecurityProtocol,
    brokers: HashMap<i32, BrokerEndpoint>,
    topics: HashMap<String, Vec<Partition>>,
    topic_names: Vec<String>,
    connections: HashMap<String, Connection>,
}

impl ClusterMetadata {
    /// Connect to the first reachable bootstrap endpoint and load metadata
    /// for `topics`.
    #[instrument(name = "metadata-bootstrap", level = "debug", skip(config))]
    pub async fn bootstrap(config: ClientConfig, topics: Vec<String>) -> Result<ClusterMetadata> {
        let mut metadata = Self::empty(config, topics)?;
        metadata.refresh().await?;
        Ok(metadata)
    }

    pub(crate) fn empty(config: ClientConfig, topics: Vec<String>) -> Result<ClusterMetadata> {
        let security_protocol = config
            .bootstrap
            .first()
            .map(|endpoint| endpoint.security_protocol)
            .ok_or_else(|| Error::Config("no bootstrap servers".to_owned()))?;
        Ok(ClusterMetadata {
            config,
            security_protocol,
            brokers: HashMap::new(),
            topics: HashMap::new(),
            topic_names: topics,
            connections: HashMap::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The protocol used for every broker, taken from the bootstrap list.
    pub fn security_protocol(&self) -> SecurityProtocol {
        self.security_protocol
    }

    /// Reload brokers and tracked topics from any broker that answers.
    #[instrument(name = "metadata-refresh", level = "debug", skip(self))]
    pub async fn refresh(&mut self) -> Result<()> {
        let request = protocol::MetadataRequest::new(self.topic_names.clone());
        let mut candidates: Vec<BrokerEndpoint> = self.brokers.values().cloned().collect();
        candidates.extend(self.config.bootstrap.iter().cloned());

        let mut last_error = Error::Config("no bootstrap servers".to_owned());
        for endpoint in candidates {
            let connection = match self.connection_to(&endpoint).await {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::warn!("Metadata from {} unavailable: {}", endpoint, err);
                    last_error = err;
                    continue;
                }
            };
            match connection.request(&request).await {
                Ok(response) => {
                    self.apply(response);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!("Metadata request to {} failed: {}", endpoint, err);
                    if err.is_connection_fatal() {
                        self.invalidate(&endpoint);
                    }
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    fn apply(&mut self, response: protocol::MetadataResponse) {
        self.brokers = response
            .brokers
            .into_iter()
            .filter_map(|broker| {
                let port = u16::try_from(broker.port).ok()?;
                Some((
                    broker.node_id,
                    BrokerEndpoint::new(broker.host, port, self.security_protocol),
                ))
            })
            .collect();
        for topic in response.topics {
            if !topic.error_code.is_ok() {
                tracing::warn!("Metadata for {} returned {:?}", topic.name, topic.error_code);
                self.topics.remove(&topic.name);
                continue;
            }
            let mut partitions = topic.partitions;
            partitions.sort_by_key(|p| p.partition_index);
            self.topics.insert(topic.name, partitions);
        }
        tracing::debug!(
            "Metadata has {} brokers and {} topics",
            self.brokers.len(),
            self.topics.len()
        );
    }

    /// Start tracking `topic`, refreshing if nothing is known about it yet.
    pub async fn ensure_topic(&mut self, topic: &str) -> Result<()> {
        if self.topics.contains_key(topic) {
            return Ok(());
        }
        if !self.topic_names.iter().any(|t| t == topic) {
            self.topic_names.push(topic.to_owned());
        }
        self.refresh().await?;
        if self.topics.contains_key(topic) {
            Ok(())
        } else {
            Err(Error::Broker(KafkaCode::UnknownTopicOrPartition))
        }
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        self.topics.get(topic).map(|p| p.len() as i32)
    }

    pub fn partitions(&self, topic: &str) -> Vec<i32> {
        self.topics
            .get(topic)
            .map(|partitions| partitions.iter().map(|p| p.partition_index).collect())
            .unwrap_or_default()
    }

    pub fn broker(&self, node_id: i32) -> Option<&BrokerEndpoint> {
        self.brokers.get(&node_id)
    }

    /// Node ID of the leader for `topic`/`partition`.
    pub fn leader_for(&self, topic: &str, partition: i32) -> Result<i32> {
        let no_leader = || Error::NoLeader {
            topic: topic.to_owned(),
            partition,
        };
        let leader = self
            .topics
            .get(topic)
            .and_then(|partitions| partitions.iter().find(|p| p.partition_index == partition))
            .map(|p| p.leader_id)
            .ok_or_else(no_leader)?;
        if leader < 0 || !self.brokers.contains_key(&leader) {
            return Err(no_leader());
        }
        Ok(leader)
    }

    /// Group `partitions` by the node that leads them.
    pub fn group_by_leader<'a, I>(&self, partitions: I) -> Result<HashMap<i32, Vec<TopicPartition>>>
    where
        I: IntoIterator<Item = &'a TopicPartition>,
    {
        let mut by_leader: HashMap<i32, Vec<TopicPartition>> = HashMap::new();
        for tp in partitions {
            let leader = self.leader_for(&tp.topic, tp.partition)?;
            by_leader.entry(leader).or_default().push(tp.clone());
        }
        Ok(by_leader)
    }

    pub async fn broker_connection(&mut self, node_id: i32) -> Result<Connection> {
        let endpoint = self.brokers.get(&node_id).cloned().ok_or_else(|| {
            Error::Config(format!("broker {} is not in the cluster metadata", node_id))
        })?;
        self.connection_to(&endpoint).await
    }

    pub async fn leader_connection(&mut self, topic: &str, partition: i32) -> Result<Connection> {
        let leader = self.leader_for(topic, partition)?;
        self.broker_connection(leader).await
    }

    /// A connection to any broker, for requests that any broker can answer.
    pub async fn any_connection(&mut self) -> Result<Connection> {
        if let Some(connection) = self.connections.values().find(|c| c.is_usable()) {
            return Ok(connection.clone());
        }
        let mut candidates: Vec<BrokerEndpoint> = self.brokers.values().cloned().collect();
        candidates.extend(self.config.bootstrap.iter().cloned());
        let mut last_error = Error::Config("no bootstrap servers".to_owned());
        for endpoint in candidates {
            match self.connection_to(&endpoint).await {
                Ok(connection) => return Ok(connection),
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }

    /// The pooled connection to `endpoint`, opening a new one when there
    /// is none or the pooled one is no longer usable.
    pub async fn connection_to(&mut self, endpoint: &BrokerEndpoint) -> Result<Connection> {
        let address = endpoint.address();
        if let Some(connection) = self.connections.get(&address) {
            if connection.is_usable() {
                return Ok(connection.clone());
            }
            tracing::debug!(
                "Replacing connection to {} in state {:?}",
                address,
                connection.state()
            );
            connection.close();
        }
        let connection = Connection::open(endpoint, &self.config).await?;
        self.connections.insert(address, connection.clone());
        Ok(connection)
    }

    /// Drop the pooled connection to `endpoint`.
    pub fn invalidate(&mut self, endpoint: &BrokerEndpoint) {
        if let Some(connection) = self.connections.remove(&endpoint.address()) {
            connection.close();
        }
    }

    pub fn invalidate_broker(&mut self, node_id: i32) {
        if let Some(endpoint) = self.brokers.get(&node_id).cloned() {
            self.invalidate(&endpoint);
        }
    }

    pub fn close(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.close();
        }
    }
}
