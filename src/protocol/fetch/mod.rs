//! Read record batches from partition leaders.

pub mod request;
pub mod response;
