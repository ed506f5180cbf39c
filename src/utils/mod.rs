pub mod connection_tracker;
pub mod graceful_shutdown;
pub mod headers;

pub use connection_tracker::{ConnectionStats, ConnectionTracker, ExchangeGuard, ExchangeKind};
pub use graceful_shutdown::{GracefulShutdown, ShutdownReason};
