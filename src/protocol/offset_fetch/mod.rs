//! Read back the positions a group has committed.

pub mod request;
pub mod response;
