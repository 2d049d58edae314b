//! Send record batches to partition leaders.

pub mod request;
pub mod response;
