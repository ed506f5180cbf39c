//! Request rate limiting built atop `governor`.
//!
//! A limiter is either global to the step (one bucket shared by every request of the
//! API) or keyed by client IP, by a header value or by the subscriber's API key. Limits
//! use governor's GCRA: `requests` per `period` with bursts up to `requests`.
//! Keyed limiters forget idle keys every [`PRUNE_EVERY`] checks.
use std::{
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    NotUntil,
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed, keyed::DefaultKeyedStateStore},
};
use http::{HeaderName, HeaderValue, StatusCode, header};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    core::{
        context::{ExecutionContext, attributes},
        failure::{ExecutionFailure, keys},
    },
    ports::policy::{Policy, PolicyError, PolicyFactory, PolicyResult, parse_configuration},
};

pub const POLICY_ID: &str = "rate-limit";

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Checks between two sweeps of a keyed limiter's state store
pub const PRUNE_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBy {
    #[default]
    Api,
    Ip,
    Header,
    ApiKey,
}

/// What to do when the request has no value for the limiter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub by: RateLimitBy,
    pub header_name: Option<String>,
    pub requests: u32,
    /// Humantime duration, e.g. `1s` or `5m`
    pub period: String,
    pub status_code: u16,
    pub message: String,
    pub on_missing_key: MissingKeyPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            by: RateLimitBy::Api,
            header_name: None,
            requests: 100,
            period: "1s".to_string(),
            status_code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            message: "Rate limit exceeded".to_string(),
            on_missing_key: MissingKeyPolicy::Allow,
        }
    }
}

enum Limiter {
    Direct(DirectLimiter),
    Keyed(KeyedBuckets),
}

struct KeyedBuckets {
    limiter: KeyedLimiter,
    by: KeySource,
    checks: AtomicU64,
}

impl KeyedBuckets {
    fn new(quota: Quota, by: KeySource) -> Self {
        Self {
            limiter: RateLimiter::keyed(quota),
            by,
            checks: AtomicU64::new(0),
        }
    }

    fn check(&self, key: String) -> Result<(), NotUntil<<DefaultClock as Clock>::Instant>> {
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_EVERY == 0 {
            self.prune();
        }
        self.limiter.check_key(&key)
    }

    /// Drop keys whose bucket is back to full capacity.
    fn prune(&self) {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        debug!(before, after = self.limiter.len(), "Pruned idle rate limit keys");
    }
}

enum KeySource {
    Ip,
    Header(HeaderName),
    ApiKey,
}

impl KeySource {
    fn key(&self, ctx: &ExecutionContext) -> Option<String> {
        match self {
            KeySource::Ip => ctx.request().remote_addr().map(|addr| addr.ip().to_string()),
            KeySource::Header(name) => ctx
                .request()
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            KeySource::ApiKey => ctx.attribute_str(attributes::ATTR_API_KEY).map(str::to_string),
        }
    }
}

pub struct RateLimitPolicy {
    limiter: Limiter,
    status: StatusCode,
    message: String,
    on_missing_key: MissingKeyPolicy,
}

impl RateLimitPolicy {
    pub fn new(config: &RateLimitConfig) -> Result<Self, PolicyError> {
        let period = humantime::parse_duration(&config.period)
            .map_err(|e| PolicyError::invalid_configuration(POLICY_ID, format!("invalid period '{}': {e}", config.period)))?;
        let requests = NonZeroU32::new(config.requests)
            .ok_or_else(|| PolicyError::invalid_configuration(POLICY_ID, "'requests' must be greater than 0"))?;
        let quota = Quota::with_period(period / requests.get())
            .ok_or_else(|| PolicyError::invalid_configuration(POLICY_ID, format!("invalid period: {period:?}")))?
            .allow_burst(requests);
        let status = StatusCode::from_u16(config.status_code).map_err(|_| {
            PolicyError::invalid_configuration(POLICY_ID, format!("invalid status code: {}", config.status_code))
        })?;

        let limiter = match config.by {
            RateLimitBy::Api => Limiter::Direct(RateLimiter::direct(quota)),
            RateLimitBy::Ip => Limiter::Keyed(KeyedBuckets::new(quota, KeySource::Ip)),
            RateLimitBy::ApiKey => Limiter::Keyed(KeyedBuckets::new(quota, KeySource::ApiKey)),
            RateLimitBy::Header => {
                let name = config.header_name.as_deref().ok_or_else(|| {
                    PolicyError::invalid_configuration(POLICY_ID, "'header_name' is required when limiting by header")
                })?;
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| PolicyError::invalid_configuration(POLICY_ID, format!("invalid header_name '{name}': {e}")))?;
                Limiter::Keyed(KeyedBuckets::new(quota, KeySource::Header(name)))
            }
        };

        info!(
            by = ?config.by,
            requests = config.requests,
            period = %config.period,
            "Rate limiter created"
        );
        Ok(Self {
            limiter,
            status,
            message: config.message.clone(),
            on_missing_key: config.on_missing_key,
        })
    }

    fn rejected(&self, ctx: &mut ExecutionContext, retry_after_secs: Option<u64>) -> PolicyResult {
        if let Some(seconds) = retry_after_secs {
            ctx.response_mut()
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds.max(1)));
        }
        PolicyResult::InterruptWith(
            ExecutionFailure::new(self.status)
                .key(keys::RATE_LIMIT_TOO_MANY_REQUESTS)
                .message(self.message.clone()),
        )
    }
}

#[async_trait]
impl Policy for RateLimitPolicy {
    fn id(&self) -> &str {
        POLICY_ID
    }

    async fn on_request(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
        let outcome = match &self.limiter {
            Limiter::Direct(limiter) => limiter.check(),
            Limiter::Keyed(buckets) => match buckets.by.key(ctx) {
                Some(key) => buckets.check(key),
                None => {
                    return Ok(match self.on_missing_key {
                        MissingKeyPolicy::Allow => PolicyResult::Continue,
                        MissingKeyPolicy::Deny => self.rejected(ctx, None),
                    });
                }
            },
        };

        match outcome {
            Ok(()) => Ok(PolicyResult::Continue),
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                debug!(request.id = %ctx.request().id(), wait_ms = wait.as_millis() as u64, "Rate limit exceeded");
                Ok(self.rejected(ctx, Some(wait.as_secs_f64().ceil() as u64)))
            }
        }
    }
}

pub struct RateLimitFactory;

impl PolicyFactory for RateLimitFactory {
    fn policy_id(&self) -> &str {
        POLICY_ID
    }

    fn create(&self, configuration: &Value) -> Result<Arc<dyn Policy>, PolicyError> {
        let config: RateLimitConfig = parse_configuration(POLICY_ID, configuration)?;
        Ok(Arc::new(RateLimitPolicy::new(&config)?))
    }
}
