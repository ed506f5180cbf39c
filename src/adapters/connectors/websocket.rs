//! WebSocket upgrade proxying.
//!
//! The backend handshake runs first. When the backend accepts, the client gets a `101`
//! and a spawned task pumps frames between both peers once hyper hands over the
//! upgraded client connection. When either side closes, the other side is closed too.
//! A backend rejection is returned as [`ConnectorError::Rejected`] and rendered by the
//! response funnel like any other failure.
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use http::{HeaderValue, StatusCode, header};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message, client::IntoClientRequest, handshake::derive_accept_key, protocol::Role,
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::models::HttpClientOptions,
    core::{
        context::{Completion, ExecutionContext, internal},
        failure::ExecutionFailure,
    },
    metrics,
    ports::connector::ConnectorError,
    utils::headers::{WEBSOCKET_HANDSHAKE, strip_hop_by_hop},
};

type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `http(s)://` to `ws(s)://`
pub fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

pub async fn connect(
    ctx: &mut ExecutionContext,
    url: &str,
    options: &HttpClientOptions,
) -> Result<(), ConnectorError> {
    let Some(client_key) = ctx
        .request()
        .header(header::SEC_WEBSOCKET_KEY.as_str())
        .map(str::to_string)
    else {
        return Err(ConnectorError::Failure(
            ExecutionFailure::new(StatusCode::BAD_REQUEST).message("Missing Sec-WebSocket-Key header"),
        ));
    };

    let backend_url = websocket_url(url);
    let mut request = backend_url
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectorError::Connection(format!("Invalid WebSocket target '{backend_url}': {e}")))?;

    let mut forwarded = ctx.request().headers().clone();
    strip_hop_by_hop(&mut forwarded);
    for (name, value) in forwarded.iter() {
        if !WEBSOCKET_HANDSHAKE.contains(name) {
            request.headers_mut().append(name.clone(), value.clone());
        }
    }

    let connect_timeout = options.connect_timeout_secs;
    let cancellation = ctx.cancellation().clone();
    let handshake = tokio::select! {
        result = tokio::time::timeout(Duration::from_secs(connect_timeout), connect_async(request)) => result,
        _ = cancellation.cancelled() => return Err(ConnectorError::Cancelled),
    };

    let (backend, backend_response) = match handshake {
        Ok(Ok(connected)) => connected,
        Ok(Err(tungstenite::Error::Http(response))) => {
            info!(
                request.id = %ctx.request().id(),
                backend = %backend_url,
                status = response.status().as_u16(),
                "WebSocket upgrade rejected by backend"
            );
            metrics::increment_websocket_session("rejected");
            return Err(ConnectorError::Rejected {
                status: response.status(),
            });
        }
        Ok(Err(e)) => {
            metrics::increment_websocket_session("error");
            return Err(ConnectorError::Connection(format!("WebSocket connection to {backend_url} failed: {e}")));
        }
        Err(_) => {
            metrics::increment_websocket_session("error");
            return Err(ConnectorError::Timeout(connect_timeout));
        }
    };

    let Some(on_upgrade) = ctx.request_mut().take_on_upgrade() else {
        drop(backend);
        return Err(ConnectorError::Failure(
            ExecutionFailure::new(StatusCode::BAD_REQUEST).message("Connection cannot be upgraded"),
        ));
    };

    let response = ctx.response_mut();
    response.set_status(StatusCode::SWITCHING_PROTOCOLS);
    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&derive_accept_key(client_key.as_bytes())) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    }
    if let Some(protocol) = backend_response.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }

    // the session now owns completion; the response funnel must not fire it
    let completion = ctx.internal_attribute::<Completion>(internal::COMPLETION).cloned();
    ctx.remove_internal_attribute(internal::COMPLETION);

    let request_id = ctx.request().id().to_string();
    let idle_timeout = Duration::from_secs(options.idle_timeout_secs);
    tokio::spawn(async move {
        let outcome = run_session(on_upgrade, backend, idle_timeout, &request_id).await;
        debug!(request.id = %request_id, outcome, "WebSocket session ended");
        metrics::increment_websocket_session(outcome);
        if let Some(completion) = completion {
            completion.complete();
        }
    });
    Ok(())
}

async fn run_session(
    on_upgrade: OnUpgrade,
    backend: BackendStream,
    idle_timeout: Duration,
    request_id: &str,
) -> &'static str {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(request.id = %request_id, error = %e, "Client connection upgrade failed");
            let mut backend = backend;
            let _ = backend.close(None).await;
            return "upgrade_failed";
        }
    };
    let client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let outcome = loop {
        let step = tokio::time::timeout(idle_timeout, async {
            tokio::select! {
                message = client_rx.next() => forward(message, &mut backend_tx).await,
                message = backend_rx.next() => forward(message, &mut client_tx).await,
            }
        })
        .await;
        match step {
            Ok(None) => continue,
            Ok(Some(outcome)) => break outcome,
            Err(_) => break "idle_timeout",
        }
    };

    let _ = client_tx.close().await;
    let _ = backend_tx.close().await;
    outcome
}

/// Forward one frame; `Some(outcome)` when the session is over.
async fn forward<S>(
    message: Option<Result<Message, tungstenite::Error>>,
    sink: &mut S,
) -> Option<&'static str>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match message {
        Some(Ok(message)) => {
            let closing = message.is_close();
            if let Err(e) = sink.send(message).await {
                debug!(error = %e, "Unable to forward WebSocket frame");
                return Some("error");
            }
            closing.then_some("closed")
        }
        Some(Err(e)) => {
            debug!(error = %e, "WebSocket read failed");
            Some("error")
        }
        None => Some("closed"),
    }
}
