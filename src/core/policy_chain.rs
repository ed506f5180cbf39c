use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream};
use http::{StatusCode, header};
use tracing::{error, warn};

use crate::{
    core::{
        context::{ExecutionContext, Phase, TransformError, internal},
        failure::ExecutionFailure,
        flow::{Flow, FlowResolver},
        hooks::{HookOutcome, HookSet},
        policy::PolicyManager,
    },
    ports::policy::PolicyResult,
};

/// How a chain ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Completed,
    /// A policy interrupted the request and produced the response itself
    Interrupted,
    /// A policy interrupted the request with a failure, also recorded on the context
    Failed(ExecutionFailure),
}

impl ChainOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ChainOutcome::Completed)
    }

    pub fn hook_outcome(&self) -> HookOutcome<'_> {
        match self {
            ChainOutcome::Completed => HookOutcome::Completed,
            ChainOutcome::Interrupted => HookOutcome::Interrupted,
            ChainOutcome::Failed(failure) => HookOutcome::Failed(failure),
        }
    }
}

/// Executes the policies of one flow scope for a phase.
///
/// Flows are resolved once per request, during the request phase, and the same flows run
/// the response phase.
pub struct FlowChain {
    id: String,
    resolver: FlowResolver,
    policy_manager: Arc<PolicyManager>,
    hooks: HookSet,
}

impl FlowChain {
    pub fn new(
        id: impl Into<String>,
        resolver: FlowResolver,
        policy_manager: Arc<PolicyManager>,
        hooks: HookSet,
    ) -> Self {
        Self {
            id: id.into(),
            resolver,
            policy_manager,
            hooks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn flows(&self, ctx: &mut ExecutionContext, phase: Phase) -> Vec<Arc<Flow>> {
        let key = format!("{}{}", internal::RESOLVED_FLOWS_PREFIX, self.id);
        if phase == Phase::Response {
            if let Some(flows) = ctx.internal_attribute::<Vec<Arc<Flow>>>(&key) {
                return flows.clone();
            }
        }
        let flows = self.resolver.resolve(ctx);
        ctx.set_internal_attribute(key, flows.clone());
        flows
    }

    pub async fn execute(&self, ctx: &mut ExecutionContext, phase: Phase) -> ChainOutcome {
        if self.resolver.is_empty() {
            return ChainOutcome::Completed;
        }

        let flows = self.flows(ctx, phase);
        if flows.is_empty() {
            return ChainOutcome::Completed;
        }

        self.hooks.pre(&self.id, ctx, Some(phase));
        let mut outcome = self.run_steps(ctx, phase, &flows).await;

        if outcome.is_completed() {
            if let Err(failure) = apply_transforms(ctx, phase).await {
                ctx.interrupt_with(failure.clone());
                outcome = ChainOutcome::Failed(failure);
            }
        } else {
            // transforms registered before an interruption never run
            ctx.take_transforms(phase);
        }

        self.hooks
            .outcome(&self.id, ctx, Some(phase), outcome.hook_outcome());
        outcome
    }

    async fn run_steps(
        &self,
        ctx: &mut ExecutionContext,
        phase: Phase,
        flows: &[Arc<Flow>],
    ) -> ChainOutcome {
        for flow in flows {
            let steps = match phase {
                Phase::Request => &flow.definition().request,
                Phase::Response => &flow.definition().response,
            };

            for (index, step) in steps.iter().enumerate() {
                if !step.enabled {
                    continue;
                }

                if let Some(condition) = step.condition.as_deref().filter(|c| !c.trim().is_empty()) {
                    match ctx.evaluate_condition(condition) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => {
                            warn!(
                                request.id = %ctx.request().id(),
                                flow = %flow.name(),
                                policy = %step.policy,
                                error = %e,
                                "Step condition could not be evaluated, step skipped"
                            );
                            continue;
                        }
                    }
                }

                let key = format!("{}/{}/{}/{}", self.id, flow.index(), phase, index);
                let policy = match self.policy_manager.get_or_create(&key, step).await {
                    Ok(policy) => policy,
                    Err(e) => {
                        error!(
                            request.id = %ctx.request().id(),
                            policy = %step.policy,
                            error = %e,
                            "Unable to instantiate policy"
                        );
                        self.hooks.error(&step.policy, ctx, Some(phase), &e);
                        let failure = ExecutionFailure::internal();
                        ctx.interrupt_with(failure.clone());
                        return ChainOutcome::Failed(failure);
                    }
                };

                self.hooks.pre(policy.id(), ctx, Some(phase));
                let result = match phase {
                    Phase::Request => policy.on_request(ctx).await,
                    Phase::Response => policy.on_response(ctx).await,
                };

                match result {
                    Ok(PolicyResult::Continue) => {
                        self.hooks
                            .outcome(policy.id(), ctx, Some(phase), HookOutcome::Completed);
                    }
                    Ok(PolicyResult::Interrupt) => {
                        ctx.interrupt();
                        self.hooks
                            .outcome(policy.id(), ctx, Some(phase), HookOutcome::Interrupted);
                        return ChainOutcome::Interrupted;
                    }
                    Ok(PolicyResult::InterruptWith(failure)) => {
                        ctx.interrupt_with(failure.clone());
                        self.hooks.outcome(
                            policy.id(),
                            ctx,
                            Some(phase),
                            HookOutcome::Failed(&failure),
                        );
                        return ChainOutcome::Failed(failure);
                    }
                    Err(e) => {
                        error!(
                            request.id = %ctx.request().id(),
                            policy = policy.id(),
                            error = %e,
                            "Policy execution failed"
                        );
                        self.hooks.error(policy.id(), ctx, Some(phase), &e);
                        let failure = ExecutionFailure::internal();
                        ctx.interrupt_with(failure.clone());
                        return ChainOutcome::Failed(failure);
                    }
                }
            }
        }

        ChainOutcome::Completed
    }
}

/// Pipe the phase's body through the transforms registered during the chain.
///
/// Chunks flow through the transforms one by one. When a transform interrupts, the
/// untransformed body is put back and the failure is returned.
async fn apply_transforms(ctx: &mut ExecutionContext, phase: Phase) -> Result<(), ExecutionFailure> {
    let transforms = ctx.take_transforms(phase);
    if transforms.is_empty() {
        return Ok(());
    }

    let body = match phase {
        Phase::Request => ctx.request_mut().take_body(),
        Phase::Response if ctx.response().has_body() => ctx.response_mut().take_body(),
        Phase::Response => return Ok(()),
    };

    let original: Vec<Bytes> = match body.into_data_stream().try_collect().await {
        Ok(chunks) => chunks,
        Err(e) => {
            warn!(request.id = %ctx.request().id(), phase = %phase, error = %e, "Unable to read body");
            let status = match phase {
                Phase::Request => StatusCode::BAD_REQUEST,
                Phase::Response => StatusCode::BAD_GATEWAY,
            };
            return Err(ExecutionFailure::new(status));
        }
    };

    let mut transformed = stream::iter(original.clone().into_iter().map(Ok)).boxed();
    for transform in transforms {
        transformed = transform(transformed);
    }

    let (body, result) = match transformed.try_collect::<Vec<Bytes>>().await {
        Ok(chunks) => (chunks, Ok(())),
        Err(TransformError::Interrupted(failure)) => (original, Err(failure)),
        Err(e) => {
            error!(request.id = %ctx.request().id(), phase = %phase, error = %e, "Body transformation failed");
            (original, Err(ExecutionFailure::internal()))
        }
    };

    let body = chunked_body(body);
    match phase {
        Phase::Request => {
            ctx.request_mut().headers_mut().remove(header::CONTENT_LENGTH);
            ctx.request_mut().set_body(body);
        }
        Phase::Response => {
            ctx.response_mut().headers_mut().remove(header::CONTENT_LENGTH);
            ctx.response_mut().set_body(body);
        }
    }
    result
}

fn chunked_body(chunks: Vec<Bytes>) -> Body {
    Body::from_stream(stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>)))
}
