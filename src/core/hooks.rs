use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    core::{
        context::{ExecutionContext, Phase},
        failure::ExecutionFailure,
    },
    metrics,
};

/// Observer invoked around policies, chains and the invoker.
///
/// Every method defaults to a no-op so implementations only override the call sites they
/// care about. Hooks must not block; they run inline on the request task.
pub trait Hook: Send + Sync {
    fn id(&self) -> &str;

    fn pre(&self, _component: &str, _ctx: &ExecutionContext, _phase: Option<Phase>) {}

    fn post(&self, _component: &str, _ctx: &ExecutionContext, _phase: Option<Phase>) {}

    fn interrupt(&self, _component: &str, _ctx: &ExecutionContext, _phase: Option<Phase>) {}

    fn interrupt_with(
        &self,
        _component: &str,
        _ctx: &ExecutionContext,
        _phase: Option<Phase>,
        _failure: &ExecutionFailure,
    ) {
    }

    fn error(
        &self,
        _component: &str,
        _ctx: &ExecutionContext,
        _phase: Option<Phase>,
        _error: &(dyn std::error::Error + 'static),
    ) {
    }
}

/// Outcome of a hooked stage, used to dispatch to the matching hook method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HookOutcome<'a> {
    Completed,
    Interrupted,
    Failed(&'a ExecutionFailure),
}

/// Ordered set of hooks fired at one call site.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookSet {
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self { hooks }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn pre(&self, component: &str, ctx: &ExecutionContext, phase: Option<Phase>) {
        for hook in &self.hooks {
            hook.pre(component, ctx, phase);
        }
    }

    /// Fire the hook matching `outcome`
    pub fn outcome(
        &self,
        component: &str,
        ctx: &ExecutionContext,
        phase: Option<Phase>,
        outcome: HookOutcome<'_>,
    ) {
        for hook in &self.hooks {
            match outcome {
                HookOutcome::Completed => hook.post(component, ctx, phase),
                HookOutcome::Interrupted => hook.interrupt(component, ctx, phase),
                HookOutcome::Failed(failure) => hook.interrupt_with(component, ctx, phase, failure),
            }
        }
    }

    pub fn error(
        &self,
        component: &str,
        ctx: &ExecutionContext,
        phase: Option<Phase>,
        error: &(dyn std::error::Error + 'static),
    ) {
        for hook in &self.hooks {
            hook.error(component, ctx, phase, error);
        }
    }
}

fn phase_label(phase: Option<Phase>) -> String {
    phase.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Emits a debug event per call site, tagged with the request id.
pub struct TracingHook;

impl Hook for TracingHook {
    fn id(&self) -> &str {
        "tracing"
    }

    fn pre(&self, component: &str, ctx: &ExecutionContext, phase: Option<Phase>) {
        debug!(
            request.id = %ctx.request().id(),
            component,
            phase = %phase_label(phase),
            "Entering component"
        );
    }

    fn post(&self, component: &str, ctx: &ExecutionContext, phase: Option<Phase>) {
        debug!(
            request.id = %ctx.request().id(),
            component,
            phase = %phase_label(phase),
            "Leaving component"
        );
    }

    fn interrupt(&self, component: &str, ctx: &ExecutionContext, phase: Option<Phase>) {
        debug!(
            request.id = %ctx.request().id(),
            component,
            phase = %phase_label(phase),
            "Component interrupted the request"
        );
    }

    fn interrupt_with(
        &self,
        component: &str,
        ctx: &ExecutionContext,
        phase: Option<Phase>,
        failure: &ExecutionFailure,
    ) {
        debug!(
            request.id = %ctx.request().id(),
            component,
            phase = %phase_label(phase),
            failure = %failure,
            "Component interrupted the request with a failure"
        );
    }

    fn error(
        &self,
        component: &str,
        ctx: &ExecutionContext,
        phase: Option<Phase>,
        error: &(dyn std::error::Error + 'static),
    ) {
        warn!(
            request.id = %ctx.request().id(),
            component,
            phase = %phase_label(phase),
            error = %error,
            "Component failed"
        );
    }
}

/// Counts interruptions and failures per component.
pub struct MetricsHook;

impl Hook for MetricsHook {
    fn id(&self) -> &str {
        "metrics"
    }

    fn interrupt_with(
        &self,
        component: &str,
        _ctx: &ExecutionContext,
        _phase: Option<Phase>,
        failure: &ExecutionFailure,
    ) {
        metrics::increment_policy_failure(component, failure.key.as_deref().unwrap_or("none"));
    }

    fn error(
        &self,
        component: &str,
        _ctx: &ExecutionContext,
        _phase: Option<Phase>,
        _error: &(dyn std::error::Error + 'static),
    ) {
        metrics::increment_policy_failure(component, "error");
    }
}
