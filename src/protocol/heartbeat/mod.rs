//! Tell the coordinator this member is still alive.

pub mod request;
pub mod response;
