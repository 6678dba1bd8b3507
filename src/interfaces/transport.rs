//! Transport interface for envelope delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::envelope::Envelope;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("transport is stopped")]
    Stopped,

    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Subscription parameters.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Topic/queue to consume from.
    pub endpoint: String,
    /// Maximum envelopes in flight for this subscription.
    pub concurrency: usize,
    /// Competing-consumer group label, when the transport supports one.
    pub group: Option<String>,
}

impl SubscribeOptions {
    pub fn new(endpoint: impl Into<String>, concurrency: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            concurrency,
            group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Publish parameters.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Destination topic/queue. Absent means the transport routes by the
    /// envelope's message type.
    pub endpoint: Option<String>,
    /// Ordering/partition hint.
    pub key: Option<String>,
    /// Headers merged into the envelope's headers, propagated verbatim.
    pub headers: HashMap<String, String>,
    /// Minimum delay before delivery.
    pub delay: Option<Duration>,
}

impl PublishOptions {
    /// Options targeting an explicit endpoint.
    pub fn to_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Destination for a given envelope: explicit endpoint or message type.
    pub fn resolve_endpoint<'a>(&'a self, envelope: &'a Envelope) -> &'a str {
        self.endpoint.as_deref().unwrap_or(envelope.message_type())
    }
}

/// Handler invoked per delivered envelope.
///
/// Returning `Err` means nack: the transport redelivers the envelope.
pub trait DeliveryHandler: Send + Sync {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>>;
}

/// Interface for publish/subscribe envelope delivery.
///
/// Concrete drivers (AMQP, Kafka, SQS, in-memory channels) implement this
/// contract; the runtime consumes it unchanged. Implementations must be safe
/// for concurrent use.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open connections and begin accepting operations.
    async fn start(&self) -> Result<()>;

    /// Close subscriptions. No further envelopes are delivered after this
    /// returns; in-flight handler invocations are allowed to finish.
    async fn stop(&self) -> Result<()>;

    /// Register a consumer for an endpoint.
    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()>;

    /// Publish an envelope.
    async fn publish(&self, envelope: Envelope, options: PublishOptions) -> Result<()>;

    /// Whether this transport honours `PublishOptions::delay` natively.
    /// When false, the scheduler falls back to persisted timeout records.
    fn supports_delayed_delivery(&self) -> bool {
        false
    }
}
