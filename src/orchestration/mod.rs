//! Per-envelope dispatch.
//!
//! Each registered saga is wrapped in a [`SagaExecutor`] that owns its typed
//! definition and store, erased behind the [`SagaRunner`] trait so the worker
//! can fan an envelope out across sagas of different state types. Failures in
//! one saga never short-circuit another's dispatch of the same envelope.

mod executor;


pub use executor::SagaExecutor;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TimeoutBounds;
use crate::envelope::{Envelope, Message, SAGA_TIMEOUT_EXPIRED};
use crate::error::DispatchError;
use crate::middleware::Middleware;
use crate::saga::context::Outbound;
use crate::saga::definition::Correlation;

/// Shared dispatch environment, owned by the bus.
pub struct DispatchEnv<'a> {
    pub middleware: &'a [Arc<dyn Middleware>],
    pub bounds: TimeoutBounds,
    pub cancel: &'a CancellationToken,
}

/// Why an envelope could not be routed to a live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnroutableReason {
    /// No state exists and the message cannot start one.
    NoState,
    /// The instance exists but is terminal.
    Completed,
}

impl std::fmt::Display for UnroutableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnroutableReason::NoState => f.write_str("no saga instance and message cannot start one"),
            UnroutableReason::Completed => f.write_str("saga instance already completed"),
        }
    }
}

/// Terminal outcome of one saga's dispatch of one envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// State was loaded or created and the pipeline ran to persistence.
    /// `state_changed` is false when no registration's guards matched
    /// (nothing was persisted, no version bump).
    Handled {
        saga_id: Uuid,
        state_changed: bool,
        completed: bool,
    },
    /// Middleware short-circuited; nothing was persisted.
    Skipped,
    /// The correlation extractor yielded no id; the saga ignores this
    /// envelope.
    NotCorrelated,
    /// The correlation-failure policy applies.
    Unroutable(UnroutableReason),
    /// A timeout expiry arrived for a deadline that was re-armed or cleared.
    StaleTimeout,
}

/// Result of a single saga dispatch: the outcome plus side-effects buffered
/// during the (already persisted) handler run, awaiting flush.
#[derive(Debug)]
pub struct SagaDispatch {
    pub outcome: DispatchOutcome,
    pub outbound: Vec<Outbound>,
}

impl SagaDispatch {
    pub(crate) fn outcome(outcome: DispatchOutcome) -> Self {
        Self {
            outcome,
            outbound: Vec::new(),
        }
    }
}

/// Type-erased saga dispatch surface.
#[async_trait]
pub trait SagaRunner: Send + Sync {
    /// The saga's unique name.
    fn name(&self) -> &str;

    /// Message types this saga subscribes to.
    fn handled_message_types(&self) -> &HashSet<String>;

    /// Resolve correlation for a message.
    fn correlation_for(&self, message: &Message) -> Correlation;

    /// Run the full dispatch pipeline for one envelope: load or create,
    /// middleware + handler, persist. Buffered side-effects are returned for
    /// the caller to flush.
    async fn dispatch(
        &self,
        envelope: &Envelope,
        env: &DispatchEnv<'_>,
    ) -> Result<SagaDispatch, DispatchError>;
}

/// Select the runners an envelope fans out to.
///
/// Timeout expiries route by the saga name carried in the payload; all other
/// messages route by handled type.
pub(crate) fn candidates<'a>(
    runners: &'a [Arc<dyn SagaRunner>],
    message: &Message,
) -> Vec<Arc<dyn SagaRunner>> {
    if message.message_type() == SAGA_TIMEOUT_EXPIRED {
        runners
            .iter()
            .filter(|r| Some(r.name()) == message.field_str("sagaName"))
            .cloned()
            .collect()
    } else {
        runners
            .iter()
            .filter(|r| r.handled_message_types().contains(message.message_type()))
            .cloned()
            .collect()
    }
}
