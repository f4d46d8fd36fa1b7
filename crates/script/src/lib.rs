//! Standard scripts and signed messages.

pub mod message;
pub mod standard;
