//! Traits the core depends on; implementations live in `adapters`.

pub mod condition;
pub mod connector;
pub mod deployment;
pub mod http_client;
pub mod policy;
pub mod reporter;
