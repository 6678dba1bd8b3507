//! Interceptor chain around handler execution.
//!
//! Middleware wrap the handler like an onion: the first registered runs
//! outermost. Each receives the pipeline context by value and a [`Next`]
//! continuation, and must call `next.run(ctx)` exactly once to proceed.
//! Returning without calling it short-circuits the dispatch (the envelope is
//! acked, nothing is persisted) — the idempotency-dedupe pattern. Errors
//! raised by middleware are classified exactly like handler failures.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::DispatchError;

/// Result type threaded through the chain.
pub type PipelineResult = Result<PipelineContext, DispatchError>;

/// Mutable context flowing through the middleware chain.
///
/// State snapshots are JSON views of the typed saga state, filled in
/// progressively: `existing_state` after load, `pre_state`/`post_state`
/// around the handler.
pub struct PipelineContext {
    pub envelope: Envelope,
    pub saga_name: String,
    pub correlation_id: String,
    /// Set once the instance is known (existing) or generated (new).
    pub saga_id: Option<Uuid>,
    /// Whether this dispatch creates the instance.
    pub is_new: bool,
    /// Loaded state before the handler, absent for a new instance.
    pub existing_state: Option<Value>,
    /// State the handler received.
    pub pre_state: Option<Value>,
    /// State the handler returned.
    pub post_state: Option<Value>,
    /// Whether a handler registration actually ran.
    pub handler_ran: bool,
    /// Whether the handler marked the instance terminal.
    pub completed: bool,
    /// Failure text observed by outer middleware on the error path.
    pub error: Option<String>,
    trace_parent: Option<String>,
    trace_state: Option<String>,
}

impl PipelineContext {
    pub(crate) fn new(envelope: Envelope, saga_name: String, correlation_id: String) -> Self {
        Self {
            envelope,
            saga_name,
            correlation_id,
            saga_id: None,
            is_new: false,
            existing_state: None,
            pre_state: None,
            post_state: None,
            handler_ran: false,
            completed: false,
            error: None,
            trace_parent: None,
            trace_state: None,
        }
    }

    /// Record the distributed-trace continuation. For a dispatch that
    /// creates an instance, the orchestrator stores it into the newborn
    /// state's metadata.
    pub fn set_trace_context(&mut self, parent: impl Into<String>, state: Option<String>) {
        self.trace_parent = Some(parent.into());
        self.trace_state = state;
    }

    pub fn trace_context(&self) -> (Option<&str>, Option<&str>) {
        (self.trace_parent.as_deref(), self.trace_state.as_deref())
    }
}

/// An interceptor around handler execution.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: PipelineContext, next: Next<'_>) -> PipelineResult;
}

/// The innermost stage of the chain: loads, creates, and runs the handler.
pub type Terminal = dyn Fn(PipelineContext) -> BoxFuture<'static, PipelineResult> + Send + Sync;

/// Continuation handed to each middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a Terminal,
}

impl<'a> Next<'a> {
    /// Run the rest of the chain, innermost being the handler itself.
    pub async fn run(self, ctx: PipelineContext) -> PipelineResult {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(
                    ctx,
                    Next {
                        chain: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => (self.terminal)(ctx).await,
        }
    }
}

/// Run a full chain around a terminal stage.
pub(crate) async fn run_chain(
    middleware: &[Arc<dyn Middleware>],
    terminal: &Terminal,
    ctx: PipelineContext,
) -> PipelineResult {
    Next {
        chain: middleware,
        terminal,
    }
    .run(ctx)
    .await
}
