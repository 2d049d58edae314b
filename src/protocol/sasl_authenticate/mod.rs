//! Carry one round of the SASL token exchange.

pub mod request;
pub mod response;
