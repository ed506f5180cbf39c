//! `mock` endpoint for message APIs: produces a configured message on subscribe and
//! acknowledges published messages without forwarding them anywhere.
use std::{collections::HashMap, collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    config::models::{ApiType, ConnectorMode, Qos, QosCapability},
    core::{
        context::{ExecutionContext, internal},
        message::Message,
    },
    ports::connector::{ConnectorError, EndpointConfiguration, EndpointConnector, EndpointConnectorFactory},
};

pub const CONNECTOR_TYPE: &str = "mock";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockConfiguration {
    pub message_content: String,
    /// Unbounded when absent; the entrypoint's limits still apply
    pub message_count: Option<u64>,
    pub message_interval_ms: u64,
    pub headers: HashMap<String, String>,
}

impl Default for MockConfiguration {
    fn default() -> Self {
        Self {
            message_content: "mock message".to_string(),
            message_count: None,
            message_interval_ms: 1000,
            headers: HashMap::new(),
        }
    }
}

pub struct MockEndpoint {
    configuration: MockConfiguration,
    modes: HashSet<ConnectorMode>,
    qos: HashSet<Qos>,
    capabilities: HashSet<QosCapability>,
}

impl MockEndpoint {
    pub fn new(configuration: MockConfiguration) -> Self {
        Self {
            configuration,
            modes: [ConnectorMode::Subscribe, ConnectorMode::Publish].into_iter().collect(),
            qos: [Qos::None, Qos::Auto].into_iter().collect(),
            capabilities: [QosCapability::Auto].into_iter().collect(),
        }
    }

    /// Messages numbered from `start`; ids are the sequence numbers.
    fn messages(&self, start: u64) -> crate::core::message::MessageStream {
        let content = self.configuration.message_content.clone();
        let headers = self.configuration.headers.clone();
        let end = self.configuration.message_count.map_or(u64::MAX, |count| start.saturating_add(count));
        let interval = Duration::from_millis(self.configuration.message_interval_ms);

        stream::unfold(start, move |sequence| {
            let content = content.clone();
            let headers = headers.clone();
            async move {
                if sequence >= end {
                    return None;
                }
                if sequence > start && !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                let message = headers.into_iter().fold(
                    Message::new(content).with_id(sequence.to_string()),
                    |message, (name, value)| message.with_header(name, value),
                );
                Some((message, sequence + 1))
            }
        })
        .boxed()
    }
}

#[async_trait]
impl EndpointConnector for MockEndpoint {
    fn id(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn supported_api(&self) -> ApiType {
        ApiType::Message
    }

    fn supported_modes(&self) -> &HashSet<ConnectorMode> {
        &self.modes
    }

    fn supported_qos(&self) -> Option<&HashSet<Qos>> {
        Some(&self.qos)
    }

    fn supported_qos_capabilities(&self) -> Option<&HashSet<QosCapability>> {
        Some(&self.capabilities)
    }

    async fn connect(&self, ctx: &mut ExecutionContext) -> Result<(), ConnectorError> {
        if ctx.request().method() == Method::GET {
            let start = ctx
                .internal_attribute::<String>(internal::MESSAGES_RECOVERY_LAST_ID)
                .and_then(|cursor| cursor.parse::<u64>().ok())
                .map_or(0, |last| last + 1);
            debug!(request.id = %ctx.request().id(), start, "Subscribing to mock messages");
            ctx.response_mut().set_messages(self.messages(start));
            return Ok(());
        }

        let body = ctx.request_mut().take_body();
        let published = body
            .collect()
            .await
            .map_err(|e| ConnectorError::Connection(format!("Unable to read published message: {e}")))?
            .to_bytes();
        debug!(request.id = %ctx.request().id(), size = published.len(), "Mock message published");
        ctx.response_mut().set_status(StatusCode::ACCEPTED);
        Ok(())
    }
}

pub struct MockEndpointFactory;

impl EndpointConnectorFactory for MockEndpointFactory {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn create(&self, configuration: EndpointConfiguration<'_>) -> Result<Arc<dyn EndpointConnector>, ConnectorError> {
        let configuration: MockConfiguration = match configuration.configuration {
            Value::Null => MockConfiguration::default(),
            value => serde_json::from_value(value.clone())
                .map_err(|e| ConnectorError::invalid_configuration(CONNECTOR_TYPE, e))?,
        };
        Ok(Arc::new(MockEndpoint::new(configuration)))
    }
}
