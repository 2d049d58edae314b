//! Leave a group without waiting out the session timeout.

pub mod request;
pub mod response;
