use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    config::models::{PlanDefinition, SecurityType},
    core::{
        context::{ExecutionContext, attributes},
        failure::{ExecutionFailure, keys},
        hooks::{HookOutcome, HookSet},
        policy_chain::ChainOutcome,
    },
    ports::policy::{PolicyError, PolicyResult, parse_configuration},
};

/// Authentication mechanism of a plan.
#[async_trait]
pub trait SecurityPolicy: Send + Sync {
    fn id(&self) -> &str;

    /// Lower orders are tried first
    fn order(&self) -> u32;

    /// Whether the request carries what this policy authenticates (e.g. an API key)
    fn can_handle(&self, ctx: &ExecutionContext) -> bool;

    async fn authenticate(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError>;
}

/// Accepts every request. Tried last so that plans with credentials take precedence.
pub struct KeylessPolicy;

#[async_trait]
impl SecurityPolicy for KeylessPolicy {
    fn id(&self) -> &str {
        "keyless"
    }

    fn order(&self) -> u32 {
        1000
    }

    fn can_handle(&self, _ctx: &ExecutionContext) -> bool {
        true
    }

    async fn authenticate(&self, _ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
        Ok(PolicyResult::Continue)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    pub header: String,
    pub query_param: String,
    pub keys: Vec<String>,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            header: "X-Gatehouse-Api-Key".to_string(),
            query_param: "api-key".to_string(),
            keys: Vec::new(),
        }
    }
}

/// Authenticates requests carrying a known API key in a header or query parameter.
pub struct ApiKeyPolicy {
    header: String,
    query_param: String,
    keys: HashSet<String>,
}

impl ApiKeyPolicy {
    pub fn new(config: ApiKeyConfig) -> Self {
        Self {
            header: config.header,
            query_param: config.query_param,
            keys: config.keys.into_iter().collect(),
        }
    }

    fn extract(&self, ctx: &ExecutionContext) -> Option<String> {
        ctx.request()
            .header(&self.header)
            .map(str::to_string)
            .or_else(|| {
                ctx.request()
                    .query_params()
                    .remove(&self.query_param)
                    .and_then(|mut values| values.pop())
            })
    }
}

#[async_trait]
impl SecurityPolicy for ApiKeyPolicy {
    fn id(&self) -> &str {
        "api-key"
    }

    fn order(&self) -> u32 {
        500
    }

    fn can_handle(&self, ctx: &ExecutionContext) -> bool {
        self.extract(ctx).is_some()
    }

    async fn authenticate(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
        let Some(key) = self.extract(ctx) else {
            return Ok(PolicyResult::InterruptWith(
                ExecutionFailure::new(StatusCode::UNAUTHORIZED)
                    .key(keys::API_KEY_MISSING)
                    .message("Unauthorized"),
            ));
        };

        if !self.keys.contains(&key) {
            return Ok(PolicyResult::InterruptWith(
                ExecutionFailure::new(StatusCode::UNAUTHORIZED)
                    .key(keys::API_KEY_INVALID)
                    .message("Unauthorized"),
            ));
        }

        ctx.set_attribute(attributes::ATTR_API_KEY, key);
        Ok(PolicyResult::Continue)
    }
}

/// Build the security policy of a plan
pub fn create_security_policy(plan: &PlanDefinition) -> Result<Arc<dyn SecurityPolicy>, PolicyError> {
    match plan.security.kind {
        SecurityType::Keyless => Ok(Arc::new(KeylessPolicy)),
        SecurityType::ApiKey => {
            let config: ApiKeyConfig = parse_configuration("api-key", &plan.security.configuration)?;
            if config.keys.is_empty() {
                return Err(PolicyError::invalid_configuration("api-key", "no keys configured"));
            }
            Ok(Arc::new(ApiKeyPolicy::new(config)))
        }
    }
}

struct SecurityPlan {
    id: String,
    selection_rule: Option<String>,
    policy: Arc<dyn SecurityPolicy>,
}

/// Selects the plan a request is consumed through and runs its security policy.
///
/// APIs without plans are open; otherwise a request that no plan can handle is rejected
/// with 401.
pub struct SecurityChain {
    plans: Vec<SecurityPlan>,
    hooks: HookSet,
}

impl SecurityChain {
    pub fn new(plans: &[PlanDefinition], hooks: HookSet) -> Result<Self, PolicyError> {
        let mut security_plans = plans
            .iter()
            .map(|plan| {
                Ok(SecurityPlan {
                    id: plan.id.clone(),
                    selection_rule: plan.selection_rule.clone(),
                    policy: create_security_policy(plan)?,
                })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;
        // stable sort keeps declaration order between equal orders
        security_plans.sort_by_key(|plan| plan.policy.order());
        Ok(Self {
            plans: security_plans,
            hooks,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    fn select_plan(&self, ctx: &ExecutionContext) -> Option<&SecurityPlan> {
        self.plans.iter().find(|plan| {
            if !plan.policy.can_handle(ctx) {
                return false;
            }
            match &plan.selection_rule {
                None => true,
                Some(rule) => ctx.evaluate_condition(rule).unwrap_or_else(|e| {
                    warn!(plan = %plan.id, error = %e, "Plan selection rule could not be evaluated");
                    false
                }),
            }
        })
    }

    pub async fn execute(&self, ctx: &mut ExecutionContext) -> ChainOutcome {
        if self.plans.is_empty() {
            return ChainOutcome::Completed;
        }

        self.hooks.pre("security", ctx, None);

        let Some(plan) = self.select_plan(ctx) else {
            let failure = ExecutionFailure::new(StatusCode::UNAUTHORIZED)
                .key(keys::PLAN_UNRESOLVABLE)
                .message("Unauthorized");
            ctx.interrupt_with(failure.clone());
            self.hooks
                .outcome("security", ctx, None, HookOutcome::Failed(&failure));
            return ChainOutcome::Failed(failure);
        };

        debug!(plan = %plan.id, security = plan.policy.id(), "Plan selected");
        ctx.set_attribute(attributes::ATTR_PLAN, plan.id.clone());

        let outcome = match plan.policy.authenticate(ctx).await {
            Ok(PolicyResult::Continue) => ChainOutcome::Completed,
            Ok(PolicyResult::Interrupt) => {
                ctx.interrupt();
                ChainOutcome::Interrupted
            }
            Ok(PolicyResult::InterruptWith(failure)) => {
                ctx.interrupt_with(failure.clone());
                ChainOutcome::Failed(failure)
            }
            Err(e) => {
                tracing::error!(plan = %plan.id, error = %e, "Security policy failed");
                self.hooks.error("security", ctx, None, &e);
                let failure = ExecutionFailure::internal();
                ctx.interrupt_with(failure.clone());
                return ChainOutcome::Failed(failure);
            }
        };

        self.hooks
            .outcome("security", ctx, None, outcome.hook_outcome());
        outcome
    }
}
