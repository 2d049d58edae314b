//! # Kerbka
//! Rust-native Kafka wire client for clusters secured with SASL/GSSAPI.
//!
//! This crate speaks the Kafka binary protocol directly over Tokio, with
//! Kerberos authentication through SASL/GSSAPI on `SASL_PLAINTEXT` and
//! `SASL_SSL` listeners. It provides a batching producer, a group
//! consumer, and the connection and protocol layers they are built on.
//!
//! ## Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as Tokio, Nom to do the heavy lifting
//! - Authenticate before anything else goes on the wire
//! - Every failure is a typed [`Error`](prelude::Error) that says whether to retry
//!
//! ## Table of contents
//! - [Getting started](#getting-started)
//!     - [Configuration](#configuration)
//!     - [Producer](#producer)
//!     - [Consumer](#consumer)
//!     - [Connection](#connection)
//! - [Resources](#resources)
//!
//! ## Getting started
//!
//! ### Configuration
//! Everything starts from a [`ClientConfig`](prelude::ClientConfig): the
//! bootstrap servers, their security protocol, and the Kerberos identity.
//! [`ClientConfig::from_env`](prelude::ClientConfig::from_env) reads the
//! `KAFKA_*` variables.
//!
//! GSSAPI itself is reached through a
//! [`SecurityContextProvider`](prelude::SecurityContextProvider), which
//! the application supplies from its Kerberos binding.
//! ```ignore
//! let kerberos = kerbka::prelude::KerberosConfig::new("app@EXAMPLE.COM", "/etc/app.keytab");
//! let config = kerbka::prelude::ClientConfig::from_servers(
//!     "kafka1.example.com:9093,kafka2.example.com:9093",
//!     kerbka::prelude::SecurityProtocol::SaslSsl,
//! )?
//! .with_security(kerbka::prelude::SecurityConfig::kerberos(kerberos, std::sync::Arc::new(MyGssapi)));
//! ```
//!
//! ### Producer
//! A [`Producer`](prelude::Producer) sends messages to their topic. The
//! partition is picked from the key, so equal keys always land on the same
//! partition. To instantiate one, start with a
//! [`ProducerBuilder`](prelude::ProducerBuilder).
//!
//! It is buffered, with both a linger time and a batch size that flush the
//! buffer when reached. This is how latency and throughput can be tweaked
//! to achieve the desired rates.
//! ```ignore
//! let producer = kerbka::prelude::ProducerBuilder::new(config)
//!     .acks(kerbka::prelude::Acks::All)
//!     .build()
//!     .await?;
//!
//! let message = kerbka::prelude::ProduceMessage::new("my-topic", "Value").with_key("Tester");
//! let metadata = producer.send(message).await?;
//! producer.close().await?;
//! ```
//!
//! ### Consumer
//! A [`Consumer`](prelude::Consumer) is a member of a consumer group. It
//! joins on the first poll, fetches from its assigned partitions, and
//! commits only when asked to. To instantiate one, start with a
//! [`ConsumerBuilder`](prelude::ConsumerBuilder).
//! ```ignore
//! let mut consumer = kerbka::prelude::ConsumerBuilder::new(config, "my-group", vec!["my-topic".to_owned()])
//!     .build()
//!     .await?;
//!
//! let records = consumer.poll(100, std::time::Duration::from_millis(200)).await?;
//! consumer.commit_consumed().await?;
//! consumer.close().await?;
//! ```
//!
//! ### Connection
//! [`connect`] opens a single authenticated [`Connection`](network::Connection)
//! for sending raw [`protocol`] requests.
//! ```ignore
//! let endpoint = kerbka::prelude::BrokerEndpoint::parse("kafka1.example.com:9093", kerbka::prelude::SecurityProtocol::SaslSsl)?;
//! let connection = kerbka::connect(&endpoint, &security).await?;
//! let metadata = connection.request(&kerbka::protocol::MetadataRequest::new(vec![])).await?;
//! ```
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [Kafka SASL/GSSAPI](https://kafka.apache.org/documentation/#security_sasl_kerberos)
//! - [RFC 4752](https://www.rfc-editor.org/rfc/rfc4752)

mod assignor;
pub mod codec;
mod config;
mod consumer;
mod consumer_builder;
mod consumer_group;
pub mod encode;
mod error;
mod metadata;
pub mod network;
pub mod parser;
mod partitioner;
mod producer;
mod producer_builder;
pub mod protocol;
mod utils;

use tracing::instrument;

use crate::config::{BrokerEndpoint, ClientConfig, SecurityConfig};
use crate::error::Result;
use crate::network::Connection;

pub const DEFAULT_CLIENT_ID: &str = "kerbka";

/// Open a connection to one broker, authenticating first when the
/// endpoint uses SASL.
#[instrument(level = "debug", skip(security), fields(endpoint = %endpoint))]
pub async fn connect(endpoint: &BrokerEndpoint, security: &SecurityConfig) -> Result<Connection> {
    let config = ClientConfig::new(vec![endpoint.clone()]).with_security(security.clone());
    Connection::open(endpoint, &config).await
}

pub mod prelude {
    //! Main export of various structures and methods
    //!
    //! We break the library into three main sections:
    //! - [Configuration](#configuration)
    //! - [Producing](#producing)
    //! - [Consuming](#consuming)
    //!
    //! # Configuration
    //! A [`ClientConfig`] names the bootstrap brokers and holds the
    //! [`SecurityConfig`]. Nothing is read from the environment unless
    //! [`ClientConfig::from_env`] is called.
    //!
    //! # Producing
    //! The [`Producer`] struct is useful for easily sending messages to brokers.
    //! The producer is represented as a background worker holding one batch
    //! per partition, sent upon meeting either of two conditions:
    //! - The batch has reached its size in bytes
    //! - The linger time has run out
    //!
    //! Transient broker errors are retried with backoff. Retries never
    //! reorder the records of a partition.
    //!
    //! # Consuming
    //! The [`Consumer`] struct is one member of a consumer group. The group
    //! leader splits the partitions with a round robin assignor. A
    //! [`RebalanceListener`] hears about partitions before they are taken
    //! away and after new ones arrive.
    pub use crate::assignor::ROUND_ROBIN_PROTOCOL;
    pub use crate::config::{BrokerEndpoint, ClientConfig, SecurityConfig, SecurityProtocol, TlsConfig};
    pub use crate::consumer::{
        AutoOffsetReset, ConsumeMessage, Consumer, NoopListener, PartitionOffsets, RebalanceListener,
    };
    pub use crate::consumer_builder::{ConsumerBuilder, DEFAULT_GROUP_ID};
    pub use crate::consumer_group::MembershipState;
    pub use crate::error::{Disposition, Error, KafkaCode, NegotiationError, Result};
    pub use crate::metadata::{ClusterMetadata, TopicPartition};
    pub use crate::network::sasl::{
        ContextStep, KerberosConfig, NoGssapi, SecurityContext, SecurityContextProvider,
    };
    pub use crate::network::{Connection, ConnectionState, PendingResponse};
    pub use crate::partitioner::partition_for_key;
    pub use crate::producer::{Acks, DeliveryHandle, ProduceMessage, Producer, RecordMetadata};
    pub use crate::producer_builder::ProducerBuilder;
    pub use crate::protocol::Compression;

    pub use bytes;
}
