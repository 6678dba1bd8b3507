//! Per-delivery processing: fan-out, retry loop, dead-letter routing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CorrelationFailurePolicy, WorkerConfig};
use crate::dlq::{publish_dead_letter, FailureInfo};
use crate::envelope::Envelope;
use crate::error::{Classification, DispatchError, ErrorHandler, ErrorVerdict};
use crate::interfaces::transport::{PublishOptions, Transport, TransportError};
use crate::middleware::Middleware;
use crate::orchestration::{
    candidates, DispatchEnv, DispatchOutcome, SagaRunner, UnroutableReason,
};
use crate::saga::context::Outbound;
use crate::scheduler::Scheduler;

/// Shared state for every subscription of one bus.
pub(crate) struct WorkerContext {
    pub runners: Vec<Arc<dyn SagaRunner>>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub transport: Arc<dyn Transport>,
    pub scheduler: Arc<Scheduler>,
    pub config: WorkerConfig,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub cancel: CancellationToken,
}

enum SagaOutcome {
    Done,
    Nack(String),
}

/// A committed dispatch whose buffered side-effects still await emission.
///
/// Envelopes are built once, so a re-emitted message keeps its id across
/// flush retries and consumers can dedupe.
struct PendingFlush {
    saga_id: Uuid,
    completed: bool,
    outbound: Vec<(Envelope, PublishOptions)>,
}

impl PendingFlush {
    fn new(saga_id: Uuid, completed: bool, outbound: Vec<Outbound>) -> Self {
        Self {
            saga_id,
            completed,
            outbound: outbound
                .into_iter()
                .map(|out| (Envelope::new(out.message), out.options))
                .collect(),
        }
    }
}

/// Process one delivered envelope across every saga that handles its type.
///
/// Returns `Err` only when the envelope must be nacked for redelivery
/// (cancellation, failed dead-letter publish); every other path resolves
/// in-process and acks.
pub(crate) async fn process_delivery(
    ctx: &Arc<WorkerContext>,
    endpoint: &str,
    envelope: Envelope,
) -> Result<(), TransportError> {
    let matching = candidates(&ctx.runners, &envelope.message);
    if matching.is_empty() {
        debug!(
            endpoint = %endpoint,
            message_type = %envelope.message_type(),
            "No saga handles this envelope"
        );
        return Ok(());
    }

    // Each saga runs its own full dispatch; one saga's failure never
    // short-circuits another's.
    let results = futures::future::join_all(
        matching
            .into_iter()
            .map(|runner| run_saga(ctx, runner, endpoint, &envelope)),
    )
    .await;

    for result in results {
        if let SagaOutcome::Nack(reason) = result {
            return Err(TransportError::Rejected(reason));
        }
    }
    Ok(())
}

/// One saga's dispatch-with-retry loop for one envelope.
async fn run_saga(
    ctx: &WorkerContext,
    runner: Arc<dyn SagaRunner>,
    endpoint: &str,
    envelope: &Envelope,
) -> SagaOutcome {
    let saga_name = runner.name().to_string();
    let policy = ctx.config.retry_for(&saga_name);
    let env = DispatchEnv {
        middleware: &ctx.middleware,
        bounds: ctx.config.timeout_bounds,
        cancel: &ctx.cancel,
    };

    let mut failure: Option<FailureInfo> = None;
    let mut attempt: u32 = 0;
    let mut pending: Option<PendingFlush> = None;

    loop {
        attempt += 1;
        if ctx.cancel.is_cancelled() {
            return SagaOutcome::Nack("worker shutting down".to_string());
        }

        let error = match &mut pending {
            // The state commit already happened on an earlier attempt. Only
            // the emission is retried, against the buffer computed then;
            // re-running the handler could find guards that no longer match
            // and lose the buffered messages entirely.
            Some(flushing) => {
                match flush(ctx, &saga_name, flushing.saga_id, &mut flushing.outbound).await {
                    Ok(()) => {
                        if flushing.completed {
                            info!(saga = %saga_name, saga_id = %flushing.saga_id, "Saga completed");
                        }
                        return SagaOutcome::Done;
                    }
                    Err(e) => e,
                }
            }
            None => match runner.dispatch(envelope, &env).await {
                Ok(dispatch) => match dispatch.outcome {
                    DispatchOutcome::Handled {
                        saga_id, completed, ..
                    } => {
                        let mut flushing = PendingFlush::new(saga_id, completed, dispatch.outbound);
                        match flush(ctx, &saga_name, saga_id, &mut flushing.outbound).await {
                            Ok(()) => {
                                if completed {
                                    info!(saga = %saga_name, saga_id = %saga_id, "Saga completed");
                                }
                                return SagaOutcome::Done;
                            }
                            // Persistence committed; keep what is left of
                            // the buffer and retry emission only.
                            Err(e) => {
                                pending = Some(flushing);
                                e
                            }
                        }
                    }
                    DispatchOutcome::Unroutable(reason) => {
                        return unroutable(ctx, &saga_name, reason, endpoint, envelope).await;
                    }
                    DispatchOutcome::Skipped => {
                        debug!(saga = %saga_name, "Dispatch short-circuited by middleware");
                        return SagaOutcome::Done;
                    }
                    DispatchOutcome::NotCorrelated => {
                        debug!(saga = %saga_name, "Envelope carries no correlation id for this saga");
                        return SagaOutcome::Done;
                    }
                    DispatchOutcome::StaleTimeout => {
                        return SagaOutcome::Done;
                    }
                },
                Err(DispatchError::Cancelled) => {
                    return SagaOutcome::Nack("dispatch cancelled".to_string());
                }
                Err(e) => e,
            },
        };

        let classification = error.classification();
        match &mut failure {
            Some(info) => info.record(classification, error.to_string()),
            None => failure = Some(FailureInfo::first(classification, error.to_string())),
        }
        warn!(
            saga = %saga_name,
            envelope_id = %envelope.id,
            attempt,
            class = %classification,
            error = %error,
            "Saga dispatch failed"
        );

        match ctx.error_handler.verdict(&error, attempt) {
            ErrorVerdict::Drop => {
                info!(saga = %saga_name, envelope_id = %envelope.id, "Envelope dropped by error handler");
                return SagaOutcome::Done;
            }
            ErrorVerdict::DeadLetter => {
                let info = failure
                    .take()
                    .unwrap_or_else(|| FailureInfo::first(classification, error.to_string()));
                return dead_letter(ctx, endpoint, envelope, info).await;
            }
            ErrorVerdict::Retry => {
                if !policy.should_retry(attempt) {
                    let info = failure
                        .take()
                        .unwrap_or_else(|| FailureInfo::first(classification, error.to_string()));
                    return dead_letter(ctx, endpoint, envelope, info).await;
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(saga = %saga_name, attempt, delay = ?delay, "Backing off before retry");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        return SagaOutcome::Nack("cancelled during backoff".to_string());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Emit buffered side-effects after a successful persist.
///
/// Published entries are drained from the front, so a failure leaves exactly
/// the unemitted tail for the caller to retry. The entry that failed may
/// still have reached the broker, which is the documented at-least-once
/// behaviour.
async fn flush(
    ctx: &WorkerContext,
    saga_name: &str,
    saga_id: Uuid,
    outbound: &mut Vec<(Envelope, PublishOptions)>,
) -> Result<(), DispatchError> {
    while let Some((envelope, options)) = outbound.first() {
        ctx.scheduler
            .publish(envelope.clone(), options.clone(), Some((saga_name, saga_id)))
            .await?;
        outbound.remove(0);
    }
    Ok(())
}

/// Apply the correlation-failure policy.
async fn unroutable(
    ctx: &WorkerContext,
    saga_name: &str,
    reason: UnroutableReason,
    endpoint: &str,
    envelope: &Envelope,
) -> SagaOutcome {
    match ctx.config.on_correlation_failure {
        CorrelationFailurePolicy::Drop => {
            debug!(
                saga = %saga_name,
                envelope_id = %envelope.id,
                %reason,
                "Dropping unroutable envelope"
            );
            SagaOutcome::Done
        }
        CorrelationFailurePolicy::Dlq => {
            let info = FailureInfo::first(
                Classification::Permanent,
                format!("correlation failure for saga '{saga_name}': {reason}"),
            );
            dead_letter(ctx, endpoint, envelope, info).await
        }
    }
}

/// Republish to the DLQ and ack, or nack when even that fails.
async fn dead_letter(
    ctx: &WorkerContext,
    endpoint: &str,
    envelope: &Envelope,
    failure: FailureInfo,
) -> SagaOutcome {
    match publish_dead_letter(
        ctx.transport.as_ref(),
        envelope,
        endpoint,
        &ctx.config.dlq_suffix,
        &failure,
    )
    .await
    {
        Ok(()) => SagaOutcome::Done,
        Err(e) => {
            error!(
                envelope_id = %envelope.id,
                error = %e,
                "Dead-letter publish failed, nacking for redelivery"
            );
            SagaOutcome::Nack("dead-letter publish failed".to_string())
        }
    }
}
