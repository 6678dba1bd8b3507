//! In-memory channel transport for standalone mode.
//!
//! Endpoints map to tokio channels within a single process. Each
//! subscription gets its own queue and consumer task; publishing fans out
//! to every subscription on the endpoint, and a semaphore caps the
//! envelopes in flight per subscription. Delayed delivery is native (a
//! sleeping task), so the scheduler never needs persisted timeouts here.
//!
//! Rejected deliveries are logged and dropped; there is no broker to
//! redeliver within a single process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::interfaces::transport::{
    DeliveryHandler, PublishOptions, Result, SubscribeOptions, Transport, TransportError,
};

struct Subscription {
    sender: mpsc::UnboundedSender<Envelope>,
}

/// In-process transport backed by tokio channels.
pub struct ChannelTransport {
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    started: RwLock<bool>,
    cancel: CancellationToken,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            started: RwLock::new(false),
            cancel: CancellationToken::new(),
        }
    }

    async fn deliver(&self, endpoint: &str, envelope: Envelope) {
        let subscriptions = self.subscriptions.read().await;
        match subscriptions.get(endpoint) {
            Some(subs) if !subs.is_empty() => {
                for subscription in subs {
                    // Send failures mean the consumer loop is gone; stop()
                    // already tore it down.
                    let _ = subscription.sender.send(envelope.clone());
                }
                debug!(
                    endpoint = %endpoint,
                    receivers = subs.len(),
                    "Delivered envelope"
                );
            }
            _ => {
                debug!(endpoint = %endpoint, "Published with no subscribers");
            }
        }
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn start(&self) -> Result<()> {
        *self.started.write().await = true;
        info!("Channel transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.started.write().await = false;
        // Dropping the senders ends every consumer loop; the token also
        // discards pending delayed publishes.
        self.subscriptions.write().await.clear();
        self.cancel.cancel();
        info!("Channel transport stopped");
        Ok(())
    }

    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();
        let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let endpoint = options.endpoint.clone();

        {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions
                .entry(options.endpoint.clone())
                .or_default()
                .push(Subscription { sender });
        }

        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let handler = Arc::clone(&handler);
                let endpoint = endpoint.clone();
                tokio::spawn(async move {
                    let id = envelope.id;
                    if let Err(e) = handler.handle(envelope).await {
                        warn!(
                            endpoint = %endpoint,
                            envelope_id = %id,
                            error = %e,
                            "Delivery rejected"
                        );
                    }
                    drop(permit);
                });
            }
        });

        info!(
            endpoint = %options.endpoint,
            concurrency = options.concurrency,
            "Subscription registered"
        );
        Ok(())
    }

    async fn publish(&self, mut envelope: Envelope, options: PublishOptions) -> Result<()> {
        if !*self.started.read().await {
            return Err(TransportError::Stopped);
        }

        let endpoint = options.resolve_endpoint(&envelope).to_string();
        for (key, value) in &options.headers {
            envelope.headers.insert(key.clone(), value.clone());
        }
        if let Some(key) = &options.key {
            envelope.partition_key = Some(key.clone());
        }

        match options.delay {
            None => {
                self.deliver(&endpoint, envelope).await;
            }
            Some(delay) => {
                let cancel = self.cancel.clone();
                let sender_map = self.subscriptions.read().await;
                let targets: Vec<mpsc::UnboundedSender<Envelope>> = sender_map
                    .get(&endpoint)
                    .map(|subs| subs.iter().map(|s| s.sender.clone()).collect())
                    .unwrap_or_default();
                drop(sender_map);

                debug!(endpoint = %endpoint, delay = ?delay, "Delayed publish scheduled");
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            for target in targets {
                                let _ = target.send(envelope.clone());
                            }
                        }
                    }
                });
            }
        }
        Ok(())
    }

    fn supports_delayed_delivery(&self) -> bool {
        true
    }
}
