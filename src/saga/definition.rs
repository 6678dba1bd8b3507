//! Immutable saga descriptors.
//!
//! A definition is produced once by [`crate::saga::builder::SagaBuilder`] at
//! startup and shared across workers. It owns the correlation rules, the
//! initial-state factory, and the ordered guarded handler registrations for
//! each message type.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::envelope::Message;
use crate::error::HandlerError;
use crate::saga::context::HandlerContext;
use crate::saga::state::SagaState;

/// Correlation rule key matching any message type without a specific rule.
pub const WILDCARD: &str = "*";

/// Outcome of resolving a message against a saga's correlation rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    /// Whether a matching message may create a new instance.
    pub can_start: bool,
    /// The extracted correlation id, `None` when the message carries none.
    pub correlation_id: Option<String>,
}

impl Correlation {
    pub(crate) fn none() -> Self {
        Self {
            can_start: false,
            correlation_id: None,
        }
    }
}

/// Extracts the correlation id from a message.
pub type CorrelationExtractor = Arc<dyn Fn(&Message) -> Option<String> + Send + Sync>;

/// Predicate gating a handler on the current state and message.
pub type Guard<S> = Arc<dyn Fn(&S, &Message) -> bool + Send + Sync>;

/// Async saga handler: receives the message, the current state, and the
/// dispatch context; returns the new state.
pub type HandlerFn<S> = Arc<
    dyn Fn(Message, S, HandlerContext) -> BoxFuture<'static, Result<S, HandlerError>>
        + Send
        + Sync,
>;

/// Factory producing the initial state for a new instance.
pub type InitialStateFactory<S> =
    Arc<dyn Fn(&Message, &HandlerContext) -> Result<S, HandlerError> + Send + Sync>;

pub(crate) struct CorrelationRule {
    pub can_start: bool,
    pub extract: CorrelationExtractor,
}

pub(crate) struct HandlerRegistration<S> {
    pub guards: Vec<Guard<S>>,
    pub handler: HandlerFn<S>,
}

impl<S> HandlerRegistration<S> {
    /// All guards must pass (logical AND).
    fn accepts(&self, state: &S, message: &Message) -> bool {
        self.guards.iter().all(|guard| guard(state, message))
    }
}

/// Immutable saga descriptor.
pub struct SagaDefinition<S: SagaState> {
    name: String,
    correlations: HashMap<String, CorrelationRule>,
    handlers: HashMap<String, Vec<HandlerRegistration<S>>>,
    initial: InitialStateFactory<S>,
    handled_types: HashSet<String>,
}

impl<S: SagaState> SagaDefinition<S> {
    pub(crate) fn new(
        name: String,
        correlations: HashMap<String, CorrelationRule>,
        handlers: HashMap<String, Vec<HandlerRegistration<S>>>,
        initial: InitialStateFactory<S>,
    ) -> Self {
        let handled_types = handlers
            .keys()
            .chain(correlations.keys())
            .filter(|t| t.as_str() != WILDCARD)
            .cloned()
            .collect();
        Self {
            name,
            correlations,
            handlers,
            initial,
            handled_types,
        }
    }

    /// Identifier, unique within a bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The finite set of message types this saga consumes: every type with a
    /// handler or a specific correlation rule. The wildcard rule widens
    /// correlation, not subscription.
    pub fn handled_message_types(&self) -> &HashSet<String> {
        &self.handled_types
    }

    /// Resolve a message against the correlation rules. A specific rule wins
    /// over the wildcard; no rule yields `{can_start: false, None}`.
    pub fn correlation_for(&self, message: &Message) -> Correlation {
        let rule = self
            .correlations
            .get(message.message_type())
            .or_else(|| self.correlations.get(WILDCARD));
        match rule {
            Some(rule) => Correlation {
                can_start: rule.can_start,
                correlation_id: (rule.extract)(message),
            },
            None => Correlation::none(),
        }
    }

    /// Invoked exactly once per instance, on its starting message.
    pub(crate) fn create_initial_state(
        &self,
        message: &Message,
        ctx: &HandlerContext,
    ) -> Result<S, HandlerError> {
        (self.initial)(message, ctx)
    }

    /// Run the first registration for this message type whose guards are
    /// satisfied. Returns the new state and whether a handler ran; when no
    /// registration matches, the state is returned unchanged.
    pub(crate) async fn handle(
        &self,
        message: &Message,
        state: S,
        ctx: &HandlerContext,
    ) -> Result<(S, bool), HandlerError> {
        let Some(registrations) = self.handlers.get(message.message_type()) else {
            return Ok((state, false));
        };
        for registration in registrations {
            if registration.accepts(&state, message) {
                let new_state =
                    (registration.handler)(message.clone(), state, ctx.clone()).await?;
                return Ok((new_state, true));
            }
        }
        Ok((state, false))
    }
}
