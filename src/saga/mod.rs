//! Saga definition model: state, correlation, guarded handlers, context.

pub mod builder;
pub mod context;
pub mod definition;
pub mod state;

pub use builder::{BuildError, HandlerBuilder, SagaBuilder};
pub use context::{HandlerContext, Outbound};
pub use definition::{Correlation, SagaDefinition, WILDCARD};
pub use state::{SagaMetadata, SagaState};
