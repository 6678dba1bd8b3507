//! Typed dispatch pipeline for one saga.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::{Envelope, Message, SAGA_TIMEOUT_EXPIRED};
use crate::error::DispatchError;
use crate::interfaces::store::SagaStore;
use crate::interfaces::transport::PublishOptions;
use crate::middleware::{run_chain, PipelineContext, PipelineResult};
use crate::saga::context::{HandlerContext, Outbound};
use crate::saga::definition::{Correlation, SagaDefinition};
use crate::saga::state::{SagaMetadata, SagaState};
use crate::scheduler::timeout_expired_message;

use super::{DispatchEnv, DispatchOutcome, SagaDispatch, SagaRunner, UnroutableReason};

/// Binds a saga definition to its store and runs the dispatch pipeline.
pub struct SagaExecutor<S: SagaState> {
    definition: Arc<SagaDefinition<S>>,
    store: Arc<dyn SagaStore<S>>,
}

impl<S: SagaState> SagaExecutor<S> {
    pub fn new(definition: SagaDefinition<S>, store: Arc<dyn SagaStore<S>>) -> Self {
        Self {
            definition: Arc::new(definition),
            store,
        }
    }

    fn snapshot(state: &S) -> Result<Value, DispatchError> {
        serde_json::to_value(state).map_err(|e| DispatchError::Serialization(e.to_string()))
    }

    /// A timeout expiry is stale when its armed deadline no longer matches
    /// the deadline stored in metadata (re-armed) or none is stored
    /// (cleared).
    fn is_stale_timeout(state: &S, message: &Message) -> bool {
        let Some(expires_at) = state.metadata().timeout_expires_at else {
            return true;
        };
        let set_at = message
            .field_str("timeoutSetAt")
            .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok());
        let timeout_ms = message.field_u64("timeoutMs");
        match (set_at, timeout_ms) {
            (Some(set_at), Some(ms)) => {
                let armed = set_at.with_timezone(&Utc) + chrono::Duration::milliseconds(ms as i64);
                (armed - expires_at).num_milliseconds().abs() > 1
            }
            _ => true,
        }
    }
}

#[async_trait]
impl<S: SagaState> SagaRunner for SagaExecutor<S> {
    fn name(&self) -> &str {
        self.definition.name()
    }

    fn handled_message_types(&self) -> &HashSet<String> {
        self.definition.handled_message_types()
    }

    fn correlation_for(&self, message: &Message) -> Correlation {
        if message.message_type() == SAGA_TIMEOUT_EXPIRED {
            // System expiries carry their own routing; they never start.
            if message.field_str("sagaName") == Some(self.definition.name()) {
                return Correlation {
                    can_start: false,
                    correlation_id: message.field_str("correlationId").map(str::to_string),
                };
            }
            return Correlation::none();
        }
        self.definition.correlation_for(message)
    }

    async fn dispatch(
        &self,
        envelope: &Envelope,
        env: &DispatchEnv<'_>,
    ) -> Result<SagaDispatch, DispatchError> {
        let saga_name = self.definition.name();
        let message = &envelope.message;

        let correlation = self.correlation_for(message);
        let Some(correlation_id) = correlation.correlation_id else {
            return Ok(SagaDispatch::outcome(DispatchOutcome::NotCorrelated));
        };

        if env.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let existing = self
            .store
            .get_by_correlation_id(saga_name, &correlation_id)
            .await?;

        let pre_state = match existing {
            Some(state) if state.metadata().is_completed => {
                debug!(
                    saga = %saga_name,
                    correlation_id = %correlation_id,
                    "Envelope targets a completed saga"
                );
                return Ok(SagaDispatch::outcome(DispatchOutcome::Unroutable(
                    UnroutableReason::Completed,
                )));
            }
            Some(state) => {
                if message.message_type() == SAGA_TIMEOUT_EXPIRED
                    && Self::is_stale_timeout(&state, message)
                {
                    debug!(
                        saga = %saga_name,
                        correlation_id = %correlation_id,
                        "Dropping stale timeout expiry"
                    );
                    return Ok(SagaDispatch::outcome(DispatchOutcome::StaleTimeout));
                }
                Some(state)
            }
            None if correlation.can_start => None,
            None => {
                return Ok(SagaDispatch::outcome(DispatchOutcome::Unroutable(
                    UnroutableReason::NoState,
                )));
            }
        };

        let is_new = pre_state.is_none();
        let pre_meta = pre_state.as_ref().map(|s| s.metadata().clone());
        let saga_id = pre_meta
            .as_ref()
            .map(|m| m.saga_id)
            .unwrap_or_else(Uuid::new_v4);

        let handler_ctx = HandlerContext::new(
            envelope.clone(),
            saga_name.to_string(),
            saga_id,
            correlation_id.clone(),
            env.bounds,
        );

        let mut pipeline_ctx = PipelineContext::new(
            envelope.clone(),
            saga_name.to_string(),
            correlation_id.clone(),
        );
        pipeline_ctx.saga_id = Some(saga_id);
        pipeline_ctx.is_new = is_new;
        if let Some(state) = &pre_state {
            pipeline_ctx.existing_state = Some(Self::snapshot(state)?);
        }

        // The terminal stage captures only cheaply clonable handles so the
        // chain can box it as a 'static future. The typed post-state leaves
        // through the slot; the pipeline context carries JSON views.
        let result_slot: Arc<Mutex<Option<(S, bool)>>> = Arc::new(Mutex::new(None));
        let error_slot: Arc<Mutex<Option<DispatchError>>> = Arc::new(Mutex::new(None));
        let pre_slot: Arc<Mutex<Option<S>>> = Arc::new(Mutex::new(pre_state));
        let entered = Arc::new(AtomicBool::new(false));

        let terminal = {
            let definition = Arc::clone(&self.definition);
            let handler_ctx = handler_ctx.clone();
            let message = message.clone();
            let result_slot = Arc::clone(&result_slot);
            let error_slot = Arc::clone(&error_slot);
            let pre_slot = Arc::clone(&pre_slot);
            let entered = Arc::clone(&entered);
            move |mut ctx: PipelineContext| -> BoxFuture<'static, PipelineResult> {
                let definition = Arc::clone(&definition);
                let handler_ctx = handler_ctx.clone();
                let message = message.clone();
                let result_slot = Arc::clone(&result_slot);
                let error_slot = Arc::clone(&error_slot);
                let pre_slot = Arc::clone(&pre_slot);
                let entered = Arc::clone(&entered);
                Box::pin(async move {
                    if entered.swap(true, Ordering::SeqCst) {
                        return Err(DispatchError::Pipeline(
                            "handler stage entered more than once".to_string(),
                        ));
                    }

                    let run = async {
                        let pre = pre_slot.lock().expect("pre-state lock poisoned").take();
                        let state = match pre {
                            Some(state) => state,
                            None => definition
                                .create_initial_state(&message, &handler_ctx)
                                .map_err(|source| DispatchError::InitialState {
                                    saga: definition.name().to_string(),
                                    source,
                                })?,
                        };
                        let pre_snapshot = Self::snapshot(&state)?;

                        let (post, handler_ran) = definition
                            .handle(&message, state, &handler_ctx)
                            .await
                            .map_err(|source| DispatchError::Handler {
                                saga: definition.name().to_string(),
                                source,
                            })?;

                        let post_snapshot = Self::snapshot(&post)?;
                        Ok::<_, DispatchError>((pre_snapshot, post, post_snapshot, handler_ran))
                    };

                    match run.await {
                        Ok((pre_snapshot, post, post_snapshot, handler_ran)) => {
                            ctx.pre_state = Some(pre_snapshot);
                            ctx.post_state = Some(post_snapshot);
                            ctx.handler_ran = handler_ran;
                            ctx.completed = handler_ctx.is_completed();
                            *result_slot.lock().expect("result lock poisoned") =
                                Some((post, handler_ran));
                        }
                        // Recorded in the context so outer middleware can
                        // observe the failure; the executor re-raises it
                        // after the chain unwinds.
                        Err(e) => {
                            ctx.error = Some(e.to_string());
                            *error_slot.lock().expect("error lock poisoned") = Some(e);
                        }
                    }
                    Ok(ctx)
                })
            }
        };

        let pipeline_ctx = run_chain(env.middleware, &terminal, pipeline_ctx).await?;

        if let Some(error) = error_slot.lock().expect("error lock poisoned").take() {
            return Err(error);
        }

        let taken = result_slot.lock().expect("result lock poisoned").take();
        let Some((mut post, handler_ran)) = taken else {
            debug!(saga = %saga_name, correlation_id = %correlation_id, "Middleware short-circuited dispatch");
            return Ok(SagaDispatch::outcome(DispatchOutcome::Skipped));
        };

        // A correlated message with no matching registration leaves the
        // state untouched: no persist, no version bump.
        if !handler_ran && !is_new {
            return Ok(SagaDispatch {
                outcome: DispatchOutcome::Handled {
                    saga_id,
                    state_changed: false,
                    completed: false,
                },
                outbound: Vec::new(),
            });
        }

        if env.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let completed = handler_ctx.is_completed();
        let armed_timeout_ms = handler_ctx.saga_timeout_ms();
        let now = Utc::now();

        if let Some(pre_meta) = pre_meta {
            let meta = post.metadata_mut();
            meta.saga_id = pre_meta.saga_id;
            meta.version = pre_meta.version + 1;
            meta.created_at = pre_meta.created_at;
            meta.updated_at = now.max(pre_meta.updated_at);
            meta.is_completed = completed;
            meta.archived_at = pre_meta.archived_at;
            meta.trace_parent = pre_meta.trace_parent;
            meta.trace_state = pre_meta.trace_state;
            match armed_timeout_ms {
                Some(ms) => {
                    meta.timeout_ms = Some(ms);
                    meta.timeout_expires_at = Some(now + chrono::Duration::milliseconds(ms as i64));
                }
                // A fired timeout is consumed with the update it triggered.
                None if message.message_type() == SAGA_TIMEOUT_EXPIRED => {
                    meta.timeout_ms = None;
                    meta.timeout_expires_at = None;
                }
                None => {
                    meta.timeout_ms = pre_meta.timeout_ms;
                    meta.timeout_expires_at = pre_meta.timeout_expires_at;
                }
            }
            self.store
                .update(saga_name, &post, pre_meta.version)
                .await?;
            debug!(
                saga = %saga_name,
                saga_id = %saga_id,
                version = post.metadata().version,
                completed,
                "Saga state updated"
            );
        } else {
            let meta = post.metadata_mut();
            *meta = SagaMetadata::new(saga_id, now);
            meta.is_completed = completed;
            let (trace_parent, trace_state) = pipeline_ctx.trace_context();
            meta.trace_parent = trace_parent.map(str::to_string);
            meta.trace_state = trace_state.map(str::to_string);
            if let Some(ms) = armed_timeout_ms {
                meta.timeout_ms = Some(ms);
                meta.timeout_expires_at = Some(now + chrono::Duration::milliseconds(ms as i64));
            }
            self.store.insert(saga_name, &correlation_id, &post).await?;
            debug!(
                saga = %saga_name,
                saga_id = %saga_id,
                correlation_id = %correlation_id,
                "Saga instance created"
            );
        }

        let mut outbound = handler_ctx.take_outbound();
        if let Some(ms) = armed_timeout_ms {
            let expiry = timeout_expired_message(saga_name, saga_id, &correlation_id, ms, now)?;
            outbound.push(Outbound {
                message: expiry,
                options: PublishOptions::default().with_delay(Duration::from_millis(ms)),
            });
        }

        Ok(SagaDispatch {
            outcome: DispatchOutcome::Handled {
                saga_id,
                state_changed: true,
                completed,
            },
            outbound,
        })
    }
}
