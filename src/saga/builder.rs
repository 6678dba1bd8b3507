//! Fluent builder for saga definitions.
//!
//! Registrations accumulate into plain maps; `build()` validates and moves
//! them into an immutable [`SagaDefinition`]. The `.on(..)` chain returns a
//! sub-builder that writes its registration back on `.handle(..)`. The
//! builder is not thread-safe during construction; the produced definition
//! is.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::envelope::{Message, SAGA_TIMEOUT_EXPIRED};
use crate::error::HandlerError;
use crate::saga::context::HandlerContext;
use crate::saga::definition::{
    CorrelationRule, HandlerRegistration, SagaDefinition,
};
use crate::saga::state::SagaState;

/// Build-time validation errors.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("saga name must not be empty")]
    MissingName,

    #[error("saga '{0}' has no correlation rule with can_start")]
    NoStartingCorrelation(String),

    #[error("saga '{0}' is missing an initial state factory")]
    MissingInitialState(String),

    #[error("saga '{0}' must not start from the reserved timeout type")]
    ReservedStartingType(String),
}

/// Accumulates correlation rules, handlers, and the initial-state factory.
///
/// # Example
///
/// ```ignore
/// let saga = SagaBuilder::new("orders")
///     .correlate_start("OrderSubmitted", |m| m.field_str("orderId").map(Into::into))
///     .correlate("*", |m| m.field_str("orderId").map(Into::into))
///     .initial(|_msg, _ctx| Ok(OrderState::new()))
///     .on("PaymentCaptured")
///     .when(|state, _| state.status == "submitted")
///     .handle(|_msg, mut state, _ctx| async move {
///         state.status = "paid".into();
///         Ok(state)
///     })
///     .build()?;
/// ```
pub struct SagaBuilder<S: SagaState> {
    name: String,
    correlations: HashMap<String, CorrelationRule>,
    handlers: HashMap<String, Vec<HandlerRegistration<S>>>,
    initial: Option<super::definition::InitialStateFactory<S>>,
}

impl<S: SagaState> SagaBuilder<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            correlations: HashMap::new(),
            handlers: HashMap::new(),
            initial: None,
        }
    }

    /// Register a correlation rule for a message type (or `"*"`).
    pub fn correlate<F>(self, message_type: impl Into<String>, extract: F) -> Self
    where
        F: Fn(&Message) -> Option<String> + Send + Sync + 'static,
    {
        self.add_correlation(message_type.into(), extract, false)
    }

    /// Register a correlation rule whose messages may create a new instance.
    pub fn correlate_start<F>(self, message_type: impl Into<String>, extract: F) -> Self
    where
        F: Fn(&Message) -> Option<String> + Send + Sync + 'static,
    {
        self.add_correlation(message_type.into(), extract, true)
    }

    fn add_correlation<F>(mut self, message_type: String, extract: F, can_start: bool) -> Self
    where
        F: Fn(&Message) -> Option<String> + Send + Sync + 'static,
    {
        self.correlations.insert(
            message_type,
            CorrelationRule {
                can_start,
                extract: Arc::new(extract),
            },
        );
        self
    }

    /// Set the initial-state factory. Mandatory.
    pub fn initial<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Message, &HandlerContext) -> Result<S, HandlerError> + Send + Sync + 'static,
    {
        self.initial = Some(Arc::new(factory));
        self
    }

    /// Begin a guarded handler registration for a message type.
    pub fn on(self, message_type: impl Into<String>) -> HandlerBuilder<S> {
        HandlerBuilder {
            saga: self,
            message_type: message_type.into(),
            guards: Vec::new(),
        }
    }

    /// Validate and produce the immutable definition.
    pub fn build(self) -> Result<SagaDefinition<S>, BuildError> {
        if self.name.is_empty() {
            return Err(BuildError::MissingName);
        }
        let has_start = self.correlations.values().any(|rule| rule.can_start);
        if !has_start {
            return Err(BuildError::NoStartingCorrelation(self.name));
        }
        if self
            .correlations
            .get(SAGA_TIMEOUT_EXPIRED)
            .is_some_and(|rule| rule.can_start)
        {
            return Err(BuildError::ReservedStartingType(self.name));
        }
        let Some(initial) = self.initial else {
            return Err(BuildError::MissingInitialState(self.name));
        };
        Ok(SagaDefinition::new(
            self.name,
            self.correlations,
            self.handlers,
            initial,
        ))
    }
}

/// Sub-builder produced by [`SagaBuilder::on`].
pub struct HandlerBuilder<S: SagaState> {
    saga: SagaBuilder<S>,
    message_type: String,
    guards: Vec<super::definition::Guard<S>>,
}

impl<S: SagaState> HandlerBuilder<S> {
    /// Add a guard. Repeated guards combine with logical AND.
    pub fn when<F>(mut self, guard: F) -> Self
    where
        F: Fn(&S, &Message) -> bool + Send + Sync + 'static,
    {
        self.guards.push(Arc::new(guard));
        self
    }

    /// Finish the registration and return to the saga builder.
    ///
    /// Registrations for the same type form an ordered list; dispatch runs
    /// the first whose guards are satisfied.
    pub fn handle<F, Fut>(self, handler: F) -> SagaBuilder<S>
    where
        F: Fn(Message, S, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, HandlerError>> + Send + 'static,
    {
        let mut saga = self.saga;
        saga.handlers
            .entry(self.message_type)
            .or_default()
            .push(HandlerRegistration {
                guards: self.guards,
                handler: Arc::new(move |message, state, ctx| {
                    Box::pin(handler(message, state, ctx))
                }),
            });
        saga
    }
}
