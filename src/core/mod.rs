pub mod acceptor;
pub mod component;
pub mod connector;
pub mod context;
pub mod cors;
pub mod endpoint;
pub mod failure;
pub mod flow;
pub mod hooks;
pub mod invoker;
pub mod load_balancer;
pub mod message;
pub mod policy;
pub mod policy_chain;
pub mod reactor;
pub mod security;
pub mod template;

pub use context::{ExecutionContext, Phase};
pub use failure::ExecutionFailure;
pub use reactor::{ApiReactor, Reactor, ReactorBuilder, ReactorError};
