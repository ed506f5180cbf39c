use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    config::models::HealthCheckConfig,
    core::{
        Reactor,
        endpoint::{EndpointManager, EndpointStatus},
    },
    ports::http_client::HttpClient,
};

#[derive(Debug, Default, Clone, Copy)]
struct Streak {
    successes: u32,
    failures: u32,
}

/// Active health checking of the endpoints of every deployed API.
///
/// Endpoints whose connector exposes a probe target are polled at a fixed interval;
/// `unhealthy_threshold` consecutive failures mark an endpoint down and
/// `healthy_threshold` consecutive successes bring it back.
pub struct HealthChecker {
    reactor: Arc<Reactor>,
    http_client: Arc<dyn HttpClient>,
    config: HealthCheckConfig,
    streaks: Mutex<HashMap<String, Streak>>,
}

impl HealthChecker {
    pub fn new(reactor: Arc<Reactor>, http_client: Arc<dyn HttpClient>, config: HealthCheckConfig) -> Self {
        Self {
            reactor,
            http_client,
            config,
            streaks: Mutex::new(HashMap::new()),
        }
    }

    /// Run the health checker loop until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            tracing::info!("Health checking is disabled");
            return;
        }

        let interval = Duration::from_secs(self.config.interval_secs);
        tracing::info!(
            interval_secs = self.config.interval_secs,
            timeout_secs = self.config.timeout_secs,
            path = %self.config.path,
            "Starting health checker"
        );

        loop {
            // first probe after one interval so backends get time to start
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Health checker stopped");
                    return;
                }
            }
            self.check_all().await;
        }
    }

    /// Probe every endpoint of every deployed API once.
    pub async fn check_all(&self) {
        tracing::debug!("Running health checks on all endpoints");
        let mut seen = Vec::new();

        for api in self.reactor.deployed().await {
            let manager = api.endpoints();
            for endpoint in manager.endpoints() {
                let Some(target) = endpoint.connector().health_check_target() else {
                    continue;
                };
                let url = format!("{}{}", target.trim_end_matches('/'), self.config.path);
                let key = format!("{}/{}", api.id(), endpoint.id());
                tracing::debug!(endpoint = %key, url = %url, "Health checking");

                match self.http_client.health_check(&url, self.config.timeout_secs).await {
                    Ok(true) => self.record_success(manager, endpoint.name(), &key),
                    Ok(false) => self.record_failure(manager, endpoint.name(), &key, "endpoint reported unhealthy"),
                    Err(e) => self.record_failure(manager, endpoint.name(), &key, &format!("request error: {e}")),
                }
                seen.push(key);
            }
        }

        // forget endpoints that are no longer deployed
        self.lock_streaks().retain(|key, _| seen.contains(key));
        tracing::debug!("Health check cycle completed");
    }

    fn lock_streaks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Streak>> {
        self.streaks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_success(&self, manager: &EndpointManager, endpoint: &str, key: &str) {
        let successes = {
            let mut streaks = self.lock_streaks();
            let streak = streaks.entry(key.to_string()).or_default();
            streak.successes += 1;
            streak.failures = 0;
            streak.successes
        };
        tracing::debug!(endpoint = %key, successes, "Health check succeeded");

        if successes >= self.config.healthy_threshold && manager.set_status(endpoint, EndpointStatus::Up) {
            tracing::info!(endpoint = %key, successes, "Endpoint is now UP");
        }
    }

    fn record_failure(&self, manager: &EndpointManager, endpoint: &str, key: &str, reason: &str) {
        let failures = {
            let mut streaks = self.lock_streaks();
            let streak = streaks.entry(key.to_string()).or_default();
            streak.failures += 1;
            streak.successes = 0;
            streak.failures
        };
        tracing::info!(
            endpoint = %key,
            reason,
            failures,
            threshold = self.config.unhealthy_threshold,
            "Health check failed"
        );

        if failures >= self.config.unhealthy_threshold && manager.set_status(endpoint, EndpointStatus::Down) {
            tracing::warn!(endpoint = %key, failures, reason, "Endpoint is now DOWN");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, Ordering},
    };

    use async_trait::async_trait;
    use axum::body::Body as AxumBody;
    use serde_json::json;

    use super::*;
    use crate::{
        adapters::connectors::default_connector_registry,
        config::models::{ApiType, ConnectorMode, GatewayConfig},
        core::context::ExecutionContext,
        ports::{
            connector::{ConnectorError, EndpointConfiguration, EndpointConnector, EndpointConnectorFactory},
            http_client::HttpClientError,
        },
    };

    struct MockHttpClient {
        healthy: AtomicBool,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn send_request(&self, _req: http::Request<AxumBody>) -> Result<http::Response<AxumBody>, HttpClientError> {
            Err(HttpClientError::ConnectionError("not used in tests".to_string()))
        }

        async fn health_check(&self, url: &str, _timeout_secs: u64) -> Result<bool, HttpClientError> {
            self.urls.lock().unwrap().push(url.to_string());
            Ok(self.healthy.load(Ordering::SeqCst))
        }
    }

    struct ProbeConnector {
        target: String,
        modes: HashSet<ConnectorMode>,
    }

    #[async_trait]
    impl EndpointConnector for ProbeConnector {
        fn id(&self) -> &str {
            "probe"
        }

        fn supported_api(&self) -> ApiType {
            ApiType::Proxy
        }

        fn supported_modes(&self) -> &HashSet<ConnectorMode> {
            &self.modes
        }

        fn health_check_target(&self) -> Option<&str> {
            Some(&self.target)
        }

        async fn connect(&self, _ctx: &mut ExecutionContext) -> Result<(), ConnectorError> {
            Ok(())
        }
    }

    struct ProbeFactory;

    impl EndpointConnectorFactory for ProbeFactory {
        fn connector_type(&self) -> &str {
            "probe"
        }

        fn create(&self, configuration: EndpointConfiguration) -> Result<Arc<dyn EndpointConnector>, ConnectorError> {
            let target = configuration.configuration["target"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            Ok(Arc::new(ProbeConnector {
                target,
                modes: [ConnectorMode::RequestResponse].into_iter().collect(),
            }))
        }
    }

    async fn checker(healthy: bool) -> (HealthChecker, Arc<MockHttpClient>, Arc<Reactor>) {
        let mut connectors = default_connector_registry();
        connectors.register_endpoint(Arc::new(ProbeFactory));
        let reactor = Arc::new(Reactor::builder(GatewayConfig::default()).connectors(connectors).build());
        let api = serde_json::from_value(json!({
            "id": "orders",
            "listeners": [{"path": "/orders"}],
            "endpoint_groups": [{
                "name": "default",
                "type": "probe",
                "endpoints": [{"name": "primary", "configuration": {"target": "http://backend:9000/"}}]
            }]
        }))
        .unwrap();
        reactor.deploy(api).await.unwrap();

        let client = Arc::new(MockHttpClient {
            healthy: AtomicBool::new(healthy),
            urls: Mutex::new(Vec::new()),
        });
        let config = HealthCheckConfig {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 5,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        };
        (HealthChecker::new(reactor.clone(), client.clone(), config), client, reactor)
    }

    async fn status(reactor: &Reactor) -> EndpointStatus {
        let api = reactor.api("orders").await.unwrap();
        api.endpoints().endpoints()[0].status()
    }

    #[tokio::test]
    async fn test_failures_mark_endpoint_down_after_threshold() {
        let (checker, client, reactor) = checker(false).await;

        checker.check_all().await;
        checker.check_all().await;
        assert_eq!(status(&reactor).await, EndpointStatus::Up);

        checker.check_all().await;
        assert_eq!(status(&reactor).await, EndpointStatus::Down);
        assert_eq!(client.urls.lock().unwrap()[0], "http://backend:9000/health");
    }

    #[tokio::test]
    async fn test_successes_bring_endpoint_back_up() {
        let (checker, client, reactor) = checker(false).await;
        for _ in 0..3 {
            checker.check_all().await;
        }
        assert_eq!(status(&reactor).await, EndpointStatus::Down);

        client.healthy.store(true, Ordering::SeqCst);
        checker.check_all().await;
        assert_eq!(status(&reactor).await, EndpointStatus::Down);
        checker.check_all().await;
        assert_eq!(status(&reactor).await, EndpointStatus::Up);
    }

    #[tokio::test]
    async fn test_disabled_checker_returns_immediately() {
        let (mut checker, client, _reactor) = checker(true).await;
        checker.config.enabled = false;
        tokio::time::timeout(Duration::from_secs(1), checker.run(CancellationToken::new()))
            .await
            .unwrap();
        assert!(client.urls.lock().unwrap().is_empty());
    }
}
