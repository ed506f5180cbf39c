use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    response::Response,
};
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::{
    core::{Reactor, context::Completion},
    utils::{ConnectionTracker, ExchangeKind, GracefulShutdown},
};

#[derive(Clone)]
struct ServerState {
    reactor: Arc<Reactor>,
    tracker: ConnectionTracker,
}

/// axum front of the [`Reactor`]: every request, whatever its path, goes through the
/// gateway pipeline.
pub struct HttpServer {
    state: ServerState,
}

impl HttpServer {
    pub fn new(reactor: Arc<Reactor>, tracker: ConnectionTracker) -> Self {
        Self {
            state: ServerState { reactor, tracker },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` triggers, then wait for in-flight exchanges (WebSocket
    /// sessions included) up to the drain timeout.
    pub async fn serve(&self, listener: TcpListener, shutdown: &GracefulShutdown) -> Result<()> {
        let local_addr = listener.local_addr().wrap_err("Failed to get local addr")?;
        tracing::info!(addr = %local_addr, "Gatehouse listening");

        let token = shutdown.token();
        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .wrap_err("Server error")?;

        tracing::info!(active = self.state.tracker.active(), "Server stopped accepting, draining");
        self.state.tracker.wait_for_drain(shutdown.drain_timeout()).await;
        Ok(())
    }
}

async fn handle(State(state): State<ServerState>, request: Request) -> Response<Body> {
    let _exchange = state.tracker.begin(ExchangeKind::Request);
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    // a proxied session stays counted until the reactor completes it
    let completion = is_upgrade(&request).then(|| {
        let session = state.tracker.begin(ExchangeKind::WebSocket);
        Completion::new(move || drop(session))
    });

    state
        .reactor
        .handle_with_completion(request, remote_addr, completion)
        .await
}

fn is_upgrade(request: &Request) -> bool {
    request.headers().contains_key(http::header::UPGRADE)
}
