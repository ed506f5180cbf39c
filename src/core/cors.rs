use http::{HeaderValue, Method, StatusCode, header};
use regex::Regex;
use tracing::debug;

use crate::{
    config::models::CorsConfig,
    core::{
        context::{ExecutionContext, insert_header, internal},
        failure::{ExecutionFailure, keys},
    },
};

/// What the reactor does after CORS processing of the request.
#[derive(Debug, Clone, PartialEq)]
pub enum CorsOutcome {
    /// Not a preflight; the pipeline runs normally
    Continue,
    /// Accepted preflight answered by the gateway, no flow runs
    PreflightAnswered,
    /// Accepted preflight; flows run without security and the invoker is skipped
    PreflightWithPolicies,
    /// Rejected preflight, already recorded on the context
    Rejected(ExecutionFailure),
}

#[derive(Debug)]
enum OriginMatcher {
    Any,
    Exact(String),
    Pattern(Regex),
}

impl OriginMatcher {
    fn parse(origin: &str) -> Result<Self, regex::Error> {
        if origin == "*" {
            return Ok(OriginMatcher::Any);
        }
        if origin.chars().any(|c| "^$*+?()[]{}|\\".contains(c)) {
            return Regex::new(&format!("^(?:{origin})$")).map(OriginMatcher::Pattern);
        }
        Ok(OriginMatcher::Exact(origin.to_string()))
    }

    fn matches(&self, origin: &str) -> bool {
        match self {
            OriginMatcher::Any => true,
            OriginMatcher::Exact(expected) => expected.eq_ignore_ascii_case(origin),
            OriginMatcher::Pattern(pattern) => pattern.is_match(origin),
        }
    }
}

/// CORS handling of one API, built at deploy time from its CORS settings.
#[derive(Debug)]
pub struct CorsProcessor {
    config: CorsConfig,
    origins: Vec<OriginMatcher>,
}

impl CorsProcessor {
    pub fn new(config: &CorsConfig) -> Result<Self, regex::Error> {
        let origins = config
            .allow_origin
            .iter()
            .map(|origin| OriginMatcher::parse(origin))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config: config.clone(),
            origins,
        })
    }

    /// `OPTIONS` carrying both `Origin` and `Access-Control-Request-Method`
    pub fn is_preflight(ctx: &ExecutionContext) -> bool {
        let request = ctx.request();
        request.method() == Method::OPTIONS
            && request.headers().contains_key(header::ORIGIN)
            && request
                .headers()
                .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.origins.iter().any(|matcher| matcher.matches(origin))
    }

    fn method_allowed(&self, method: &str) -> bool {
        self.config.allow_methods.is_empty()
            || self
                .config
                .allow_methods
                .iter()
                .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
    }

    fn headers_allowed(&self, requested: &[String]) -> bool {
        if self.config.allow_headers.iter().any(|h| h == "*") {
            return true;
        }
        requested.iter().all(|name| {
            self.config
                .allow_headers
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(name))
        })
    }

    /// Request phase processing: answers or rejects preflights, leaves other requests alone.
    pub fn handle_request(&self, ctx: &mut ExecutionContext) -> CorsOutcome {
        if !self.config.enabled || !Self::is_preflight(ctx) {
            return CorsOutcome::Continue;
        }

        let origin = ctx.request().header(header::ORIGIN.as_str()).unwrap_or_default().to_string();
        let method = ctx
            .request()
            .header(header::ACCESS_CONTROL_REQUEST_METHOD.as_str())
            .unwrap_or_default()
            .to_string();
        let requested_headers: Vec<String> = ctx
            .request()
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS.as_str())
            .map(|v| {
                v.split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if !self.origin_allowed(&origin)
            || !self.method_allowed(&method)
            || !self.headers_allowed(&requested_headers)
        {
            debug!(
                request.id = %ctx.request().id(),
                origin = %origin,
                method = %method,
                "CORS preflight rejected"
            );
            let status = StatusCode::from_u16(self.config.error_status_code)
                .unwrap_or(StatusCode::BAD_REQUEST);
            let failure = ExecutionFailure::new(status)
                .key(keys::CORS_PREFLIGHT_FAILED)
                .message("CORS preflight request rejected");
            ctx.interrupt_with(failure.clone());
            return CorsOutcome::Rejected(failure);
        }

        let allow_methods = if self.config.allow_methods.is_empty() {
            method
        } else {
            self.config.allow_methods.join(", ")
        };
        let allow_headers = if self.config.allow_headers.iter().any(|h| h == "*") {
            requested_headers.join(", ")
        } else {
            self.config.allow_headers.join(", ")
        };

        let headers = ctx.response_mut().headers_mut();
        self.write_origin_headers(headers, &origin);
        insert_header(headers, header::ACCESS_CONTROL_ALLOW_METHODS.as_str(), &allow_methods);
        if !allow_headers.is_empty() {
            insert_header(headers, header::ACCESS_CONTROL_ALLOW_HEADERS.as_str(), &allow_headers);
        }
        if self.config.max_age >= 0 {
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.config.max_age));
        }

        ctx.response_mut().set_status(StatusCode::OK);
        ctx.set_internal_attribute(internal::INVOKER_SKIP, true);

        if self.config.run_policies {
            ctx.set_internal_attribute(internal::SECURITY_SKIP, true);
            CorsOutcome::PreflightWithPolicies
        } else {
            CorsOutcome::PreflightAnswered
        }
    }

    /// Response phase processing for actual (non-preflight) cross-origin requests.
    pub fn handle_response(&self, ctx: &mut ExecutionContext) {
        if !self.config.enabled || Self::is_preflight(ctx) {
            return;
        }
        let Some(origin) = ctx.request().header(header::ORIGIN.as_str()).map(str::to_string) else {
            return;
        };
        if !self.origin_allowed(&origin) {
            return;
        }

        let headers = ctx.response_mut().headers_mut();
        self.write_origin_headers(headers, &origin);
        if !self.config.expose_headers.is_empty() {
            insert_header(
                headers,
                header::ACCESS_CONTROL_EXPOSE_HEADERS.as_str(),
                &self.config.expose_headers.join(", "),
            );
        }
    }

    fn write_origin_headers(&self, headers: &mut http::HeaderMap, origin: &str) {
        let wildcard = !self.config.allow_credentials
            && self.origins.iter().any(|m| matches!(m, OriginMatcher::Any));
        let allow_origin = if wildcard { "*" } else { origin };
        insert_header(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN.as_str(), allow_origin);
        if !wildcard {
            headers.append(header::VARY, HeaderValue::from_static("Origin"));
        }
        if self.config.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::Request;

    use super::*;

    fn processor(origins: &[&str], methods: &[&str]) -> CorsProcessor {
        CorsProcessor::new(&CorsConfig {
            allow_origin: origins.iter().map(|s| s.to_string()).collect(),
            allow_methods: methods.iter().map(|s| s.to_string()).collect(),
            allow_headers: vec!["x-custom".to_string()],
            ..CorsConfig::default()
        })
        .unwrap()
    }

    fn preflight(origin: &str, method: &str, headers: Option<&str>) -> ExecutionContext {
        let mut builder = Request::builder()
            .method("OPTIONS")
            .uri("/x")
            .header("origin", origin)
            .header("access-control-request-method", method);
        if let Some(headers) = headers {
            builder = builder.header("access-control-request-headers", headers);
        }
        ExecutionContext::new(builder.body(Body::empty()).unwrap(), None)
    }

    fn allow_origin(ctx: &ExecutionContext) -> Option<&str> {
        ctx.response()
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_preflight_accepted() {
        let cors = processor(&["https://a.com"], &["GET"]);
        let mut ctx = preflight("https://a.com", "GET", Some("X-Custom"));

        assert_eq!(cors.handle_request(&mut ctx), CorsOutcome::PreflightAnswered);
        assert_eq!(ctx.response().status(), StatusCode::OK);
        assert_eq!(allow_origin(&ctx), Some("https://a.com"));
        assert_eq!(
            ctx.response().headers().get("access-control-allow-methods").unwrap(),
            "GET"
        );
        assert!(ctx.internal_flag(internal::INVOKER_SKIP));
        assert!(!ctx.is_interrupted());
    }

    #[test]
    fn test_preflight_rejected_without_cors_headers() {
        let cors = CorsProcessor::new(&CorsConfig {
            allow_origin: vec!["https://a.com".to_string()],
            allow_methods: vec!["GET".to_string()],
            error_status_code: 403,
            ..CorsConfig::default()
        })
        .unwrap();

        for mut ctx in [
            preflight("https://evil.com", "GET", None),
            preflight("https://a.com", "DELETE", None),
            preflight("https://a.com", "GET", Some("x-other")),
        ] {
            let outcome = cors.handle_request(&mut ctx);
            assert!(matches!(outcome, CorsOutcome::Rejected(ref f) if f.status == StatusCode::FORBIDDEN
                && f.key.as_deref() == Some(keys::CORS_PREFLIGHT_FAILED)));
            cors.handle_response(&mut ctx);
            assert!(allow_origin(&ctx).is_none());
        }
    }

    #[test]
    fn test_pattern_origins_and_policies_mode() {
        let cors = CorsProcessor::new(&CorsConfig {
            allow_origin: vec!["https://.*\\.acme\\.com".to_string()],
            run_policies: true,
            allow_credentials: true,
            max_age: 600,
            ..CorsConfig::default()
        })
        .unwrap();

        let mut ctx = preflight("https://app.acme.com", "PUT", None);
        assert_eq!(cors.handle_request(&mut ctx), CorsOutcome::PreflightWithPolicies);
        assert!(ctx.internal_flag(internal::SECURITY_SKIP));
        assert_eq!(ctx.response().headers().get("access-control-max-age").unwrap(), "600");
        assert_eq!(
            ctx.response().headers().get("access-control-allow-credentials").unwrap(),
            "true"
        );

        let mut ctx = preflight("https://acme.com.evil.org", "PUT", None);
        assert!(matches!(cors.handle_request(&mut ctx), CorsOutcome::Rejected(_)));
    }

    #[test]
    fn test_simple_request_headers() {
        let cors = CorsProcessor::new(&CorsConfig {
            allow_origin: vec!["*".to_string()],
            expose_headers: vec!["x-total".to_string()],
            ..CorsConfig::default()
        })
        .unwrap();
        let request = Request::builder()
            .uri("/x")
            .header("origin", "https://b.com")
            .body(Body::empty())
            .unwrap();
        let mut ctx = ExecutionContext::new(request, None);

        assert_eq!(cors.handle_request(&mut ctx), CorsOutcome::Continue);
        cors.handle_response(&mut ctx);
        assert_eq!(allow_origin(&ctx), Some("*"));
        assert_eq!(
            ctx.response().headers().get("access-control-expose-headers").unwrap(),
            "x-total"
        );
    }

    #[test]
    fn test_disabled_processor_ignores_preflight() {
        let cors = CorsProcessor::new(&CorsConfig {
            enabled: false,
            ..CorsConfig::default()
        })
        .unwrap();
        let mut ctx = preflight("https://a.com", "GET", None);
        assert_eq!(cors.handle_request(&mut ctx), CorsOutcome::Continue);
    }
}
