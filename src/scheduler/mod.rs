//! Delayed self-message scheduling.
//!
//! Two realisation strategies, picked by transport capability: transports
//! with native delayed delivery get the delay forwarded on publish; all
//! others fall back to persisted timeout records drained by a reaper task.
//! The reaper removes a record only after its publish succeeds, so delivery
//! is at-least-once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, Message, SAGA_TIMEOUT_EXPIRED};
use crate::error::DispatchError;
use crate::interfaces::timeouts::{TimeoutRecord, TimeoutStore};
use crate::interfaces::transport::{PublishOptions, Transport, TransportError};

/// Records drained per reaper poll.
const DRAIN_BATCH: usize = 64;

/// Build the system message announcing a saga-level timeout expiry.
pub(crate) fn timeout_expired_message(
    saga_name: &str,
    saga_id: Uuid,
    correlation_id: &str,
    timeout_ms: u64,
    set_at: DateTime<Utc>,
) -> Result<Message, DispatchError> {
    Message::new(
        SAGA_TIMEOUT_EXPIRED,
        json!({
            "sagaId": saga_id,
            "sagaName": saga_name,
            "correlationId": correlation_id,
            "timeoutMs": timeout_ms,
            "timeoutSetAt": set_at,
        }),
    )
    .map_err(|e| DispatchError::Serialization(e.to_string()))
}

/// Routes delayed publishes to the capability the transport offers.
pub struct Scheduler {
    transport: Arc<dyn Transport>,
    timeout_store: Option<Arc<dyn TimeoutStore>>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        timeout_store: Option<Arc<dyn TimeoutStore>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            timeout_store,
            poll_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Publish an envelope, honouring `options.delay`.
    ///
    /// `saga` identifies the scheduling instance when the publish originates
    /// from a saga dispatch; it is recorded on persisted timeouts for
    /// diagnostics.
    pub async fn publish(
        &self,
        envelope: Envelope,
        options: PublishOptions,
        saga: Option<(&str, Uuid)>,
    ) -> Result<(), DispatchError> {
        let Some(delay) = options.delay else {
            return Ok(self.transport.publish(envelope, options).await?);
        };

        if self.transport.supports_delayed_delivery() {
            return Ok(self.transport.publish(envelope, options).await?);
        }

        let Some(store) = &self.timeout_store else {
            return Err(DispatchError::Transport(TransportError::Publish(
                "transport has no delayed delivery and no timeout store is configured".to_string(),
            )));
        };

        let (saga_name, saga_id) = saga.unwrap_or(("", Uuid::nil()));
        let fire_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        let record = TimeoutRecord {
            id: Uuid::new_v4(),
            saga_name: saga_name.to_string(),
            saga_id,
            fire_at,
            envelope,
            options: PublishOptions {
                delay: None,
                ..options
            },
        };
        debug!(
            record_id = %record.id,
            fire_at = %fire_at,
            "Persisted timeout record"
        );
        Ok(store.insert(record).await?)
    }

    /// Spawn the reaper when the persisted strategy is active.
    pub(crate) fn start_reaper(self: Arc<Self>) {
        if self.transport.supports_delayed_delivery() || self.timeout_store.is_none() {
            return;
        }
        let cancel = self.cancel.clone();
        let scheduler = self;
        tokio::spawn(async move {
            info!(poll_interval = ?scheduler.poll_interval, "Timeout reaper started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Timeout reaper stopped");
                        break;
                    }
                    _ = tokio::time::sleep(scheduler.poll_interval) => {
                        scheduler.drain_due(Utc::now()).await;
                    }
                }
            }
        });
    }

    /// Publish everything due at `now`. Returns the number published.
    pub(crate) async fn drain_due(&self, now: DateTime<Utc>) -> usize {
        let Some(store) = &self.timeout_store else {
            return 0;
        };
        let due = match store.due(now, DRAIN_BATCH).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Timeout reaper failed to read due records");
                return 0;
            }
        };

        let mut published = 0;
        for record in due {
            match self
                .transport
                .publish(record.envelope.clone(), record.options.clone())
                .await
            {
                Ok(()) => {
                    if let Err(e) = store.remove(record.id).await {
                        warn!(record_id = %record.id, error = %e, "Failed to ack timeout record");
                    }
                    published += 1;
                }
                Err(e) => {
                    // Left in place; the next poll retries it.
                    warn!(record_id = %record.id, error = %e, "Failed to publish due timeout");
                }
            }
        }
        published
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}
