use std::sync::Arc;

use tracing::warn;

use crate::{
    config::models::{FlowDefinition, FlowMode, PathOperator},
    core::context::ExecutionContext,
    ports::condition::{ConditionError, ConditionFilter},
};

/// Where a flow was declared; platform flows run before plan flows, plan flows before
/// API flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    Platform,
    Plan,
    Api,
}

impl FlowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStage::Platform => "platform",
            FlowStage::Plan => "plan",
            FlowStage::Api => "api",
        }
    }
}

/// A flow definition bound to its stage and position.
#[derive(Debug)]
pub struct Flow {
    definition: FlowDefinition,
    stage: FlowStage,
    index: usize,
}

impl Flow {
    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn stage(&self) -> FlowStage {
        self.stage
    }

    /// Position of the flow in its declaration list
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> String {
        self.definition
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-flow-{}", self.stage.as_str(), self.index))
    }
}

/// Matches a flow's path selector against a path, `:name` segments matching any segment.
pub fn path_matches(pattern: &str, path: &str, operator: PathOperator) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let length_ok = match operator {
        PathOperator::StartsWith => pattern.len() <= path.len(),
        PathOperator::Equals => pattern.len() == path.len(),
    };

    length_ok
        && pattern
            .iter()
            .zip(path.iter())
            .all(|(expected, actual)| expected.starts_with(':') || expected == actual)
}

/// Default flow filter: path selector on the path relative to the context path, methods
/// (empty means any) and the optional condition expression.
#[derive(Debug, Default)]
pub struct DefaultConditionFilter;

impl ConditionFilter for DefaultConditionFilter {
    fn matches(&self, ctx: &ExecutionContext, flow: &FlowDefinition) -> Result<bool, ConditionError> {
        let selector = &flow.selector;
        if !selector.path.starts_with('/') {
            return Err(ConditionError::InvalidSelector(format!(
                "path '{}' does not start with '/'",
                selector.path
            )));
        }

        if !path_matches(&selector.path, ctx.request().path_info(), selector.path_operator) {
            return Ok(false);
        }

        let method = ctx.request().method().as_str();
        if !selector.methods.is_empty()
            && !selector.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
        {
            return Ok(false);
        }

        match &selector.condition {
            Some(condition) if !condition.trim().is_empty() => Ok(ctx.evaluate_condition(condition)?),
            _ => Ok(true),
        }
    }
}

/// Resolves the flows of one scope (platform, plan or API) applicable to a request.
pub struct FlowResolver {
    flows: Vec<Arc<Flow>>,
    mode: FlowMode,
    filter: Arc<dyn ConditionFilter>,
}

impl FlowResolver {
    pub fn new(definitions: &[FlowDefinition], stage: FlowStage, mode: FlowMode) -> Self {
        Self::with_filter(definitions, stage, mode, Arc::new(DefaultConditionFilter))
    }

    pub fn with_filter(
        definitions: &[FlowDefinition],
        stage: FlowStage,
        mode: FlowMode,
        filter: Arc<dyn ConditionFilter>,
    ) -> Self {
        let flows = definitions
            .iter()
            .enumerate()
            .filter(|(_, definition)| definition.enabled)
            .map(|(index, definition)| {
                Arc::new(Flow {
                    definition: definition.clone(),
                    stage,
                    index,
                })
            })
            .collect();
        Self { flows, mode, filter }
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Applicable flows in execution order.
    ///
    /// Filter errors exclude the flow and are logged; they never fail the request.
    pub fn resolve(&self, ctx: &ExecutionContext) -> Vec<Arc<Flow>> {
        let matching = self.flows.iter().filter(|flow| {
            match self.filter.matches(ctx, &flow.definition) {
                Ok(matches) => matches,
                Err(e) => {
                    warn!(
                        request.id = %ctx.request().id(),
                        flow = %flow.name(),
                        error = %e,
                        "Flow condition could not be evaluated, flow skipped"
                    );
                    false
                }
            }
        });

        match self.mode {
            FlowMode::Default => matching.cloned().collect(),
            FlowMode::BestMatch => {
                // max_by_key keeps the last maximum, so compare on (length, reversed index)
                matching
                    .max_by_key(|flow| {
                        (
                            flow.definition.selector.path.trim_end_matches('/').len(),
                            std::cmp::Reverse(flow.index),
                        )
                    })
                    .cloned()
                    .into_iter()
                    .collect()
            }
        }
    }
}
