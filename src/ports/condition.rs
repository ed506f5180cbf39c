use thiserror::Error;

use crate::{
    config::models::FlowDefinition,
    core::{context::ExecutionContext, template::TemplateError},
};

#[derive(Error, Debug)]
pub enum ConditionError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),
}

/// Decides whether a flow applies to the current request.
pub trait ConditionFilter: Send + Sync {
    fn matches(&self, ctx: &ExecutionContext, flow: &FlowDefinition) -> Result<bool, ConditionError>;
}
