//! Gatehouse - an API gateway built around a request execution pipeline.
//!
//! Every request is driven by the [`Reactor`](core::Reactor):
//! 1. the acceptor table picks the deployed API (virtual host, then longest path)
//! 2. CORS, the platform request flows and the security chain run
//! 3. the entrypoint connector of the API accepts the request
//! 4. plan and API request flows run, then the invoker negotiates QoS with the selected
//!    endpoint and connects to it
//! 5. response flows run and the response funnel renders the outcome, exactly once
//!
//! Policies and connectors are plugins: they are created by factories registered by
//! type id, see [`adapters::default_policy_registry`] and
//! [`adapters::default_connector_registry`].
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the pipeline itself inside `core`.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use gatehouse::{
//!     adapters::{HttpServer, default_connector_registry, default_policy_registry},
//!     config::{GatewayConfig, load_api_definitions},
//!     core::Reactor,
//!     utils::{ConnectionTracker, GracefulShutdown},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let reactor = Arc::new(
//!     Reactor::builder(GatewayConfig::default())
//!         .connectors(default_connector_registry())
//!         .policies(default_policy_registry())
//!         .build(),
//! );
//! reactor.synchronize(load_api_definitions("apis")?).await;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8082").await?;
//! HttpServer::new(reactor, ConnectionTracker::new())
//!     .serve(listener, &GracefulShutdown::new())
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Ports expose `thiserror` enums; application wiring returns `eyre::Result<T>` with
//! context attached through `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Deployed APIs live in an `scc::HashMap`; acceptor tables and endpoint sets are
//! `ArcSwap` snapshots so requests in flight keep the view they started with.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HealthChecker, HttpClientAdapter, HttpServer},
    core::{ExecutionContext, Reactor},
    ports::http_client::HttpClient,
    utils::{ConnectionTracker, GracefulShutdown},
};
