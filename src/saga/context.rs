//! Per-dispatch handler context.
//!
//! Handlers never talk to the transport directly: `publish` and `schedule`
//! buffer outbound messages, and the orchestrator flushes the buffer only
//! after the state mutation has been persisted. A dispatch that fails before
//! persistence therefore emits nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::config::TimeoutBounds;
use crate::envelope::{Envelope, Message, SAGA_TIMEOUT_EXPIRED};
use crate::error::HandlerError;
use crate::interfaces::transport::PublishOptions;

/// A buffered outbound message awaiting flush.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub message: Message,
    pub options: PublishOptions,
}

/// Context handed to saga handlers and initial-state factories.
///
/// Cheap to clone; all clones share the same buffers.
#[derive(Clone)]
pub struct HandlerContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    envelope: Envelope,
    saga_name: String,
    saga_id: Uuid,
    correlation_id: String,
    bounds: TimeoutBounds,
    outbox: Mutex<Vec<Outbound>>,
    completed: AtomicBool,
    metadata: Mutex<HashMap<String, String>>,
    saga_timeout_ms: Mutex<Option<u64>>,
}

impl HandlerContext {
    pub(crate) fn new(
        envelope: Envelope,
        saga_name: String,
        saga_id: Uuid,
        correlation_id: String,
        bounds: TimeoutBounds,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                envelope,
                saga_name,
                saga_id,
                correlation_id,
                bounds,
                outbox: Mutex::new(Vec::new()),
                completed: AtomicBool::new(false),
                metadata: Mutex::new(HashMap::new()),
                saga_timeout_ms: Mutex::new(None),
            }),
        }
    }

    /// The envelope being dispatched.
    pub fn envelope(&self) -> &Envelope {
        &self.inner.envelope
    }

    /// The message being dispatched.
    pub fn message(&self) -> &Message {
        &self.inner.envelope.message
    }

    pub fn saga_name(&self) -> &str {
        &self.inner.saga_name
    }

    pub fn saga_id(&self) -> Uuid {
        self.inner.saga_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.inner.correlation_id
    }

    /// Buffer a message for publication after the state commit.
    pub fn publish(&self, message: Message) -> Result<(), HandlerError> {
        self.publish_with(message, PublishOptions::default())
    }

    /// Buffer a message with explicit routing options.
    pub fn publish_with(
        &self,
        message: Message,
        options: PublishOptions,
    ) -> Result<(), HandlerError> {
        self.reject_reserved(&message)?;
        self.push(Outbound { message, options });
        Ok(())
    }

    /// Buffer a delayed self-message.
    ///
    /// The delay must fall within the configured timeout bounds; out-of-range
    /// delays are rejected at schedule time (or clamped when the bounds are
    /// configured to clamp).
    pub fn schedule(&self, message: Message, delay: Duration) -> Result<(), HandlerError> {
        self.schedule_with(message, delay, PublishOptions::default())
    }

    /// Buffer a delayed self-message with explicit routing options.
    pub fn schedule_with(
        &self,
        message: Message,
        delay: Duration,
        options: PublishOptions,
    ) -> Result<(), HandlerError> {
        self.reject_reserved(&message)?;
        let delay_ms = self.resolve_delay(delay)?;
        self.push(Outbound {
            message,
            options: options.with_delay(Duration::from_millis(delay_ms)),
        });
        Ok(())
    }

    /// Mark the saga instance terminal. Written with the state.
    pub fn complete(&self) {
        self.inner.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Arm or re-arm the saga-level timeout.
    ///
    /// Recorded in the state metadata at persist time; the runtime delivers
    /// a `SagaTimeoutExpired` message when the deadline passes with the saga
    /// still live.
    pub fn set_saga_timeout(&self, timeout: Duration) -> Result<(), HandlerError> {
        let timeout_ms = self.resolve_delay(timeout)?;
        *self.inner.saga_timeout_ms.lock().expect("timeout lock poisoned") = Some(timeout_ms);
        Ok(())
    }

    /// Attach a key/value pair visible to later middleware and handlers of
    /// this dispatch.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .metadata
            .lock()
            .expect("metadata lock poisoned")
            .insert(key.into(), value.into());
    }

    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.inner
            .metadata
            .lock()
            .expect("metadata lock poisoned")
            .get(key)
            .cloned()
    }

    pub(crate) fn take_outbound(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.inner.outbox.lock().expect("outbox lock poisoned"))
    }

    pub(crate) fn saga_timeout_ms(&self) -> Option<u64> {
        *self.inner.saga_timeout_ms.lock().expect("timeout lock poisoned")
    }

    fn push(&self, outbound: Outbound) {
        self.inner
            .outbox
            .lock()
            .expect("outbox lock poisoned")
            .push(outbound);
    }

    fn resolve_delay(&self, delay: Duration) -> Result<u64, HandlerError> {
        let delay_ms = delay.as_millis() as u64;
        self.inner.bounds.resolve(delay_ms).ok_or_else(|| {
            HandlerError::Validation(format!(
                "delay {}ms outside allowed range [{}ms, {}ms]",
                delay_ms, self.inner.bounds.min_ms, self.inner.bounds.max_ms
            ))
        })
    }

    fn reject_reserved(&self, message: &Message) -> Result<(), HandlerError> {
        if message.message_type() == SAGA_TIMEOUT_EXPIRED {
            return Err(HandlerError::Validation(format!(
                "'{SAGA_TIMEOUT_EXPIRED}' is reserved for the runtime"
            )));
        }
        Ok(())
    }
}
