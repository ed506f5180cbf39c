//! `http-get` entrypoint: subscribers of a message API poll messages with a plain `GET`.
//!
//! The accepted media type is negotiated from `Accept` (JSON or plain text). The response
//! streams at most `limit` messages and stops after `messages_limit_duration_ms`, then
//! appends a pagination cursor the subscriber sends back as `?cursor=` to resume.
use std::{
    collections::HashSet,
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use http::{HeaderValue, Method, StatusCode, header};
use serde::Deserialize;
use serde_json::json;

use crate::{
    config::models::{ApiType, ConnectorMode, EntrypointDefinition, Qos, QosCapability},
    core::{
        context::{ExecutionContext, internal},
        failure::ExecutionFailure,
        message::Message,
    },
    ports::connector::{ConnectorError, EntrypointConnector, EntrypointConnectorFactory, QosRequirement},
};

pub const CONNECTOR_TYPE: &str = "http-get";

const NEGOTIATION: &str = "http-get.negotiation";
const CURSOR_QUERY_PARAM: &str = "cursor";
const LIMIT_QUERY_PARAM: &str = "limit";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpGetConfiguration {
    pub messages_limit_count: usize,
    pub messages_limit_duration_ms: u64,
    pub headers_in_payload: bool,
}

impl Default for HttpGetConfiguration {
    fn default() -> Self {
        Self {
            messages_limit_count: 100,
            messages_limit_duration_ms: 5000,
            headers_in_payload: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Json,
    Text,
}

impl MediaKind {
    fn content_type(self) -> &'static str {
        match self {
            MediaKind::Json => "application/json",
            MediaKind::Text => "text/plain",
        }
    }
}

/// What `handle_request` decided for the response.
#[derive(Debug, Clone)]
struct Negotiation {
    media: MediaKind,
    limit: usize,
    /// Raw `limit` query parameter, echoed in the pagination block
    requested_limit: Option<String>,
}

/// Pick the media type from `Accept` values ordered by quality. No header means plain
/// text; a wildcard means JSON; `None` when nothing acceptable is listed.
fn select_media(accept: &[&str]) -> Option<MediaKind> {
    let mut ranges: Vec<(f32, String)> = accept
        .iter()
        .flat_map(|value| value.split(','))
        .filter_map(|range| {
            let mut parts = range.split(';');
            let media = parts.next()?.trim().to_ascii_lowercase();
            if media.is_empty() {
                return None;
            }
            let quality = parts
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((quality, media))
        })
        .collect();
    if ranges.is_empty() {
        return Some(MediaKind::Text);
    }
    // stable: equal qualities keep header order
    ranges.sort_by(|a, b| b.0.total_cmp(&a.0));

    let supported = ranges.iter().find_map(|(_, media)| match media.as_str() {
        "application/json" => Some(MediaKind::Json),
        "text/plain" => Some(MediaKind::Text),
        _ => None,
    });
    supported.or_else(|| match ranges[0].1.as_str() {
        "*/*" | "application/*" => Some(MediaKind::Json),
        "text/*" => Some(MediaKind::Text),
        _ => None,
    })
}

pub struct HttpGetEntrypoint {
    configuration: HttpGetConfiguration,
    qos: QosRequirement,
    modes: HashSet<ConnectorMode>,
}

impl HttpGetEntrypoint {
    pub fn new(qos: Qos, configuration: HttpGetConfiguration) -> Self {
        let mut requirement = QosRequirement::new(qos);
        if matches!(qos, Qos::AtLeastOnce | Qos::AtMostOnce) {
            requirement = requirement.with_capability(QosCapability::Recover);
        }
        Self {
            configuration,
            qos: requirement,
            modes: [ConnectorMode::Subscribe].into_iter().collect(),
        }
    }
}

fn render_json(message: &Message, first: bool, with_headers: bool) -> Bytes {
    let mut item = json!({
        "id": message.id,
        "content": String::from_utf8_lossy(&message.content),
    });
    if with_headers {
        item["headers"] = json!(message.headers);
    }
    let separator = if first { "" } else { "," };
    Bytes::from(format!("{separator}{item}"))
}

fn render_text(message: &Message, first: bool, with_headers: bool) -> Bytes {
    let mut out = String::new();
    if !first {
        out.push('\n');
    }
    out.push_str("item\n");
    out.push_str(&format!("id: {}\n", message.id));
    out.push_str(&format!("content: {}\n", String::from_utf8_lossy(&message.content)));
    if with_headers {
        let mut headers: Vec<_> = message.headers.iter().collect();
        headers.sort();
        out.push_str(&format!("headers: {headers:?}\n"));
    }
    Bytes::from(out)
}

fn pagination(media: MediaKind, cursor: Option<String>, limit: Option<String>) -> Bytes {
    let Some(cursor) = cursor else {
        return Bytes::new();
    };
    match media {
        MediaKind::Json => {
            let mut block = json!({ "nextCursor": cursor });
            if let Some(limit) = limit {
                block["limit"] = json!(limit);
            }
            Bytes::from(format!(",\"pagination\":{block}"))
        }
        MediaKind::Text => {
            let mut out = format!("\npagination\nnextCursor: {cursor}");
            if let Some(limit) = limit {
                out.push_str(&format!("\nlimit: {limit}"));
            }
            Bytes::from(out)
        }
    }
}

#[async_trait]
impl EntrypointConnector for HttpGetEntrypoint {
    fn id(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn supported_api(&self) -> ApiType {
        ApiType::Message
    }

    fn supported_modes(&self) -> &HashSet<ConnectorMode> {
        &self.modes
    }

    fn qos_requirement(&self) -> Option<&QosRequirement> {
        Some(&self.qos)
    }

    fn matches(&self, ctx: &ExecutionContext) -> bool {
        ctx.request().method() == Method::GET
    }

    async fn handle_request(&self, ctx: &mut ExecutionContext) -> Result<(), ConnectorError> {
        let accept: Vec<&str> = ctx
            .request()
            .headers()
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let Some(media) = select_media(&accept) else {
            return Err(ConnectorError::Failure(
                ExecutionFailure::new(StatusCode::BAD_REQUEST)
                    .message(format!("Unsupported accept header: {}", accept.join(", "))),
            ));
        };

        let params = ctx.request().query_params();
        let first = |name: &str| {
            params
                .get(name)
                .and_then(|values| values.first())
                .filter(|v| !v.is_empty())
                .cloned()
        };

        let requested_limit = first(LIMIT_QUERY_PARAM);
        let mut limit = self.configuration.messages_limit_count;
        if let Some(requested) = &requested_limit {
            let requested: usize = requested.parse().map_err(|_| {
                ConnectorError::Failure(
                    ExecutionFailure::new(StatusCode::BAD_REQUEST)
                        .message(format!("Invalid limit query parameter: {requested}")),
                )
            })?;
            limit = limit.min(requested);
        }
        if let Some(cursor) = first(CURSOR_QUERY_PARAM) {
            ctx.set_internal_attribute(internal::MESSAGES_RECOVERY_LAST_ID, cursor);
        }

        ctx.set_internal_attribute(
            NEGOTIATION,
            Negotiation {
                media,
                limit,
                requested_limit,
            },
        );
        Ok(())
    }

    async fn handle_response(&self, ctx: &mut ExecutionContext) -> Result<(), ConnectorError> {
        let Some(negotiation) = ctx.internal_attribute::<Negotiation>(NEGOTIATION).cloned() else {
            return Ok(());
        };
        let messages = ctx.response_mut().take_messages().unwrap_or_else(|| stream::empty().boxed());

        let mut limited = messages.take(negotiation.limit).boxed();
        if self.configuration.messages_limit_duration_ms > 0 {
            let deadline = tokio::time::sleep(Duration::from_millis(self.configuration.messages_limit_duration_ms));
            limited = limited.take_until(deadline).boxed();
        }

        let last_id: Arc<Mutex<Option<String>>> = Arc::default();
        let media = negotiation.media;
        let with_headers = self.configuration.headers_in_payload;

        let items = {
            let last_id = last_id.clone();
            limited.enumerate().map(move |(index, message)| {
                *last_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.id.clone());
                match media {
                    MediaKind::Json => render_json(&message, index == 0, with_headers),
                    MediaKind::Text => render_text(&message, index == 0, with_headers),
                }
            })
        };
        let (open, close) = match media {
            MediaKind::Json => ("{\"items\":[", "}"),
            MediaKind::Text => ("items\n", ""),
        };
        let trailer = stream::once(async move {
            let cursor = last_id.lock().unwrap_or_else(|e| e.into_inner()).take();
            let mut tail = Vec::new();
            if media == MediaKind::Json {
                tail.extend_from_slice(b"]");
            }
            tail.extend_from_slice(&pagination(media, cursor, negotiation.requested_limit));
            tail.extend_from_slice(close.as_bytes());
            Bytes::from(tail)
        });

        let body = stream::iter([Bytes::from_static(open.as_bytes())])
            .chain(items)
            .chain(trailer)
            .map(Ok::<_, Infallible>);

        let response = ctx.response_mut();
        response.set_status(StatusCode::OK);
        response.headers_mut().remove(header::CONTENT_LENGTH);
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(media.content_type()));
        response.set_body(Body::from_stream(body));
        Ok(())
    }
}

pub struct HttpGetEntrypointFactory;

impl EntrypointConnectorFactory for HttpGetEntrypointFactory {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn create(&self, definition: &EntrypointDefinition) -> Result<Arc<dyn EntrypointConnector>, ConnectorError> {
        let configuration = match &definition.configuration {
            serde_json::Value::Null => HttpGetConfiguration::default(),
            value => serde_json::from_value(value.clone())
                .map_err(|e| ConnectorError::invalid_configuration(CONNECTOR_TYPE, e))?,
        };
        let qos = definition.qos.unwrap_or(Qos::Auto);
        Ok(Arc::new(HttpGetEntrypoint::new(qos, configuration)))
    }
}

#[cfg(test)]
mod tests {
    use http::Request;
    use http_body_util::BodyExt;

    use super::*;

    fn context(uri: &str, accept: Option<&str>) -> ExecutionContext {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(accept) = accept {
            builder = builder.header("accept", accept);
        }
        ExecutionContext::new(builder.body(Body::empty()).unwrap(), None)
    }

    fn messages(count: usize) -> crate::core::message::MessageStream {
        stream::iter((0..count).map(|i| Message::new(format!("m{i}")).with_id(i.to_string()))).boxed()
    }

    async fn body(ctx: &mut ExecutionContext) -> String {
        let bytes = ctx.response_mut().take_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_select_media() {
        assert_eq!(select_media(&[]), Some(MediaKind::Text));
        assert_eq!(select_media(&["*/*"]), Some(MediaKind::Json));
        assert_eq!(select_media(&["text/plain;q=0.5, application/json"]), Some(MediaKind::Json));
        assert_eq!(select_media(&["application/json;q=0.2", "text/plain"]), Some(MediaKind::Text));
        assert_eq!(select_media(&["image/png"]), None);
    }

    #[test]
    fn test_qos_requirement_by_level() {
        let auto = HttpGetEntrypoint::new(Qos::Auto, HttpGetConfiguration::default());
        assert!(auto.qos_requirement().unwrap().capabilities.is_empty());

        let at_least_once = HttpGetEntrypoint::new(Qos::AtLeastOnce, HttpGetConfiguration::default());
        let requirement = at_least_once.qos_requirement().unwrap();
        assert_eq!(requirement.qos, Qos::AtLeastOnce);
        assert!(requirement.capabilities.contains(&QosCapability::Recover));
    }

    #[tokio::test]
    async fn test_unsupported_accept_is_rejected() {
        let entrypoint = HttpGetEntrypoint::new(Qos::Auto, HttpGetConfiguration::default());
        let mut ctx = context("/messages", Some("image/png"));
        let result = entrypoint.handle_request(&mut ctx).await;
        assert!(matches!(
            result,
            Err(ConnectorError::Failure(failure)) if failure.status == StatusCode::BAD_REQUEST
        ));
    }

    #[tokio::test]
    async fn test_json_rendering_with_limit_and_cursor() {
        let entrypoint = HttpGetEntrypoint::new(Qos::Auto, HttpGetConfiguration::default());
        let mut ctx = context("/messages?limit=2&cursor=7", Some("application/json"));

        entrypoint.handle_request(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.internal_attribute::<String>(internal::MESSAGES_RECOVERY_LAST_ID).map(String::as_str),
            Some("7")
        );

        ctx.response_mut().set_messages(messages(5));
        entrypoint.handle_response(&mut ctx).await.unwrap();

        assert_eq!(ctx.response().headers()["content-type"], "application/json");
        let body = body(&mut ctx).await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["items"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["items"][1]["content"], "m1");
        assert_eq!(parsed["pagination"]["nextCursor"], "1");
        assert_eq!(parsed["pagination"]["limit"], "2");
    }

    #[tokio::test]
    async fn test_text_rendering_without_messages() {
        let entrypoint = HttpGetEntrypoint::new(Qos::Auto, HttpGetConfiguration::default());
        let mut ctx = context("/messages", None);
        entrypoint.handle_request(&mut ctx).await.unwrap();
        entrypoint.handle_response(&mut ctx).await.unwrap();

        assert_eq!(ctx.response().headers()["content-type"], "text/plain");
        assert_eq!(body(&mut ctx).await, "items\n");
    }

    #[tokio::test]
    async fn test_text_rendering() {
        let entrypoint = HttpGetEntrypoint::new(Qos::Auto, HttpGetConfiguration::default());
        let mut ctx = context("/messages", Some("text/plain"));
        entrypoint.handle_request(&mut ctx).await.unwrap();
        ctx.response_mut().set_messages(messages(2));
        entrypoint.handle_response(&mut ctx).await.unwrap();

        assert_eq!(
            body(&mut ctx).await,
            "items\nitem\nid: 0\ncontent: m0\n\nitem\nid: 1\ncontent: m1\n\npagination\nnextCursor: 1"
        );
    }
}
