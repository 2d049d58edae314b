//! Connection & communication with a broker.
//!
//! # Network Module
//!
//! Kafka uses a binary protocol over TCP. The protocol defines all APIs as
//! request response message pairs, each one a size delimited frame.
//!
//! The server guarantees that on a single TCP connection, requests will be
//! processed in the order they are sent and responses will return in that
//! order as well. Clients can send requests even while awaiting responses
//! for preceding requests, so a [`Connection`] pipelines: every request
//! gets a correlation ID and a pending slot, and the response is matched
//! back to its slot when it arrives.
//!
//! Listeners configured for `SASL_PLAINTEXT` or `SASL_SSL` accept nothing
//! but `SaslHandshake` and `SaslAuthenticate` until the client has
//! authenticated. [`Connection::open`] runs the GSSAPI exchange from the
//! [`sasl`] module to completion before handing the connection out.
//!
//! A connection that fails is never resumed. Clients such as
//! [`ClusterMetadata`](crate::metadata::ClusterMetadata) replace it with a
//! brand new one, which authenticates again.

mod connection;
pub mod sasl;
pub mod tcp;
pub mod tls;

pub use connection::{Connection, ConnectionState, PendingResponse};
