//! Brokers, topics, partitions and their leaders.
//!
//! Metadata is the one request any broker can answer, which makes it the
//! entry point for bootstrapping: ask any listed endpoint, learn the rest
//! of the cluster from the response.

pub mod request;
pub mod response;
