pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{load_api_definition, load_api_definitions, load_gateway_config};
pub use models::*;
pub use validation::{DefinitionValidator, ValidationError, ValidationResult};
