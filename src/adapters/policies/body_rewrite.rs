//! Regex rewrite of the request or response body, as a streaming transform.
//!
//! Matches may span chunk boundaries, so the transform gathers the whole stream before
//! rewriting and yields a single chunk. The output only depends on the concatenated
//! input, never on how the source was chunked.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream};
use regex::bytes::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::PolicyScope;
use crate::{
    core::context::{BodyStream, ExecutionContext, Phase, TransformError},
    ports::policy::{Policy, PolicyError, PolicyFactory, PolicyResult, parse_configuration},
};

pub const POLICY_ID: &str = "body-rewrite";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BodyRewriteConfig {
    pub scope: PolicyScope,
    pub pattern: String,
    /// `$1` / `${name}` refer to capture groups
    pub replacement: String,
}

pub struct BodyRewrite {
    scope: PolicyScope,
    pattern: Regex,
    replacement: Arc<Vec<u8>>,
}

impl BodyRewrite {
    pub fn new(config: BodyRewriteConfig) -> Result<Self, PolicyError> {
        if config.pattern.is_empty() {
            return Err(PolicyError::invalid_configuration(POLICY_ID, "'pattern' is required"));
        }
        let pattern = Regex::new(&config.pattern).map_err(|e| PolicyError::invalid_configuration(POLICY_ID, e))?;
        Ok(Self {
            scope: config.scope,
            pattern,
            replacement: Arc::new(config.replacement.into_bytes()),
        })
    }

    fn register(&self, ctx: &mut ExecutionContext, phase: Phase) -> PolicyResult {
        if self.scope.applies_to(phase) {
            let pattern = self.pattern.clone();
            let replacement = self.replacement.clone();
            ctx.register_transform(
                phase,
                Arc::new(move |body: BodyStream| {
                    let pattern = pattern.clone();
                    let replacement = replacement.clone();
                    stream::once(async move {
                        let chunks: Vec<Bytes> = body.try_collect().await?;
                        let whole = chunks.concat();
                        let rewritten = pattern.replace_all(&whole, replacement.as_slice());
                        Ok::<_, TransformError>(Bytes::from(rewritten.into_owned()))
                    })
                    .boxed()
                }),
            );
        }
        PolicyResult::Continue
    }
}

#[async_trait]
impl Policy for BodyRewrite {
    fn id(&self) -> &str {
        POLICY_ID
    }

    async fn on_request(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
        Ok(self.register(ctx, Phase::Request))
    }

    async fn on_response(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
        Ok(self.register(ctx, Phase::Response))
    }
}

pub struct BodyRewriteFactory;

impl PolicyFactory for BodyRewriteFactory {
    fn policy_id(&self) -> &str {
        POLICY_ID
    }

    fn create(&self, configuration: &Value) -> Result<Arc<dyn Policy>, PolicyError> {
        Ok(Arc::new(BodyRewrite::new(parse_configuration(POLICY_ID, configuration)?)?))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn policy() -> BodyRewrite {
        BodyRewrite::new(BodyRewriteConfig {
            scope: PolicyScope::Request,
            pattern: "secret-(\\d+)".to_string(),
            replacement: "redacted-$1".to_string(),
        })
        .unwrap()
    }

    async fn rewrite(policy: &BodyRewrite, chunks: &[&str]) -> Bytes {
        let request = http::Request::builder().body(axum::body::Body::empty()).unwrap();
        let mut ctx = ExecutionContext::new(request, None);
        policy.register(&mut ctx, Phase::Request);
        let transform = ctx.take_transforms(Phase::Request).remove(0);

        let source: BodyStream = stream::iter(
            chunks
                .iter()
                .map(|c| Ok::<_, TransformError>(Bytes::from(c.to_string())))
                .collect::<Vec<_>>(),
        )
        .boxed();
        let out: Vec<Bytes> = transform(source).try_collect().await.unwrap();
        Bytes::from(out.concat())
    }

    #[tokio::test]
    async fn test_rewrite_is_independent_of_chunk_boundaries() {
        let policy = policy();
        let expected = Bytes::from("id=redacted-42&other=redacted-7");

        assert_eq!(rewrite(&policy, &["id=secret-42&other=secret-7"]).await, expected);
        assert_eq!(rewrite(&policy, &["id=sec", "ret-4", "2&other=secret-", "7"]).await, expected);
        assert_eq!(
            rewrite(&policy, &["i", "d", "=", "secret-42", "&other=secret-7", ""]).await,
            expected
        );
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(BodyRewriteFactory.create(&json!({"pattern": "("})).is_err());
        assert!(BodyRewriteFactory.create(&json!({})).is_err());
    }
}
