use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    config::models::HttpClientOptions,
    core::context::insert_header,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// HTTP client adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Applies the endpoint's connect timeout, read timeout (on the response head) and
///   idle pool timeout
/// * Adds the endpoint's configured headers
/// * Rewrites `Host` to the backend authority
/// * Performs GET based health checks with timeout
///
/// One client is built per `http-proxy` endpoint; the underlying connection pool is
/// shared by the requests sent to that endpoint.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    options: HttpClientOptions,
}

impl HttpClientAdapter {
    pub fn new(options: HttpClientOptions) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(Duration::from_secs(options.connect_timeout_secs)));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(errors = ?native_certs.errors, "Some native certificates failed to load");
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(options.idle_timeout_secs))
            .build::<_, AxumBody>(https_connector);

        tracing::debug!(
            connect_timeout_secs = options.connect_timeout_secs,
            read_timeout_secs = options.read_timeout_secs,
            "Created HTTP client"
        );
        Ok(Self { client, options })
    }

    pub fn options(&self) -> &HttpClientOptions {
        &self.options
    }

    fn prepare(&self, req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let Some(host) = req.uri().host() else {
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        };
        let authority = match req.uri().port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let host_value = HeaderValue::from_str(&authority)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        req.headers_mut().insert(header::HOST, host_value);

        for (name, value) in &self.options.headers {
            insert_header(req.headers_mut(), name, value);
        }
        *req.version_mut() = Version::HTTP_11;
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, mut req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        self.prepare(&mut req)?;

        let backend = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri().authority().map_or("unknown", |a| a.as_str())
        );
        let span = tracing::info_span!(
            "backend_request",
            backend.url = %backend,
            http.method = %req.method(),
            http.path = %req.uri().path(),
            http.status_code = tracing::field::Empty,
        );

        let method = req.method().clone();
        let uri = req.uri().clone();
        let read_timeout = self.options.read_timeout_secs;

        async move {
            tracing::debug!(headers = ?req.headers(), "Sending request to backend");
            match timeout(Duration::from_secs(read_timeout), self.client.request(req)).await {
                Ok(Ok(response)) => {
                    tracing::Span::current().record("http.status_code", response.status().as_u16());
                    let (mut parts, body) = response.into_parts();
                    // framing is re-done by the server side
                    parts.headers.remove(header::TRANSFER_ENCODING);
                    Ok(Response::from_parts(parts, AxumBody::new(body)))
                }
                Ok(Err(e)) => {
                    tracing::Span::current().record("http.status_code", 599u16);
                    tracing::warn!(error = %e, "Backend request failed");
                    Err(HttpClientError::ConnectionError(format!(
                        "Request to {method} {uri} failed: {e}"
                    )))
                }
                Err(_) => {
                    tracing::warn!(timeout_secs = read_timeout, "Backend did not answer in time");
                    Err(HttpClientError::Timeout(read_timeout))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn health_check(&self, url: &str, timeout_secs: u64) -> HttpClientResult<bool> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        match timeout(Duration::from_secs(timeout_secs), self.client.request(request)).await {
            Ok(Ok(response)) => {
                let healthy = response.status().is_success();
                // drain so the connection returns to the pool
                let _ = response.into_body().collect().await;
                tracing::debug!(url, healthy, "Health check result");
                Ok(healthy)
            }
            Ok(Err(e)) => {
                tracing::debug!(url, error = %e, "Health check error");
                Ok(false)
            }
            Err(_) => Err(HttpClientError::Timeout(timeout_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn client() -> HttpClientAdapter {
        HttpClientAdapter::new(HttpClientOptions {
            headers: HashMap::from([("x-gateway".to_string(), "gatehouse".to_string())]),
            ..HttpClientOptions::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_prepare_sets_host_and_configured_headers() {
        let client = client();
        let mut req = Request::builder()
            .uri("http://backend.local:8080/orders")
            .header(header::HOST, "gateway.local")
            .body(AxumBody::empty())
            .unwrap();

        client.prepare(&mut req).unwrap();

        assert_eq!(req.headers()[header::HOST], "backend.local:8080");
        assert_eq!(req.headers()["x-gateway"], "gatehouse");
        assert_eq!(req.version(), Version::HTTP_11);
    }

    #[tokio::test]
    async fn test_relative_uri_is_rejected() {
        let client = client();
        let req = Request::builder().uri("/orders").body(AxumBody::empty()).unwrap();
        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_health_check_unreachable() {
        let client = client();
        let result = client.health_check("http://127.0.0.1:1/health", 2).await;
        assert!(matches!(result, Ok(false) | Err(HttpClientError::Timeout(_))));
    }
}
