//! Runtime behaviour tests: post-commit flush retries, saga-level timeouts,
//! the persisted-timeout reaper, error-handler overrides, and drain.
//!
//! The scenario-driven conformance suite lives in `tests/acceptance/`
//! (Gherkin); these tests cover runtime edges that need fault injection or
//! timing control.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use edda::bus::ChannelTransport;
use edda::envelope::{Envelope, Message};
use edda::error::HandlerError;
use edda::interfaces::transport::{SubscribeOptions, Transport, TransportError};
use edda::saga::{SagaBuilder, SagaMetadata};
use edda::storage::InMemorySagaStore;
use edda::Bus;

use common::{
    by_order_id, fast_config, order_message, state_of, wait_for_captured, wait_for_completed,
    wait_for_instance, wait_for_status, CaptureHandler, OrderState,
};

/// Delegating transport that fails the first publishes of one message type.
struct FlakyTransport {
    inner: Arc<ChannelTransport>,
    target: String,
    remaining_failures: Mutex<u32>,
}

impl FlakyTransport {
    fn failing(inner: Arc<ChannelTransport>, target: &str, failures: u32) -> Self {
        Self {
            inner,
            target: target.to_string(),
            remaining_failures: Mutex::new(failures),
        }
    }
}

#[async_trait::async_trait]
impl Transport for FlakyTransport {
    async fn start(&self) -> edda::interfaces::transport::Result<()> {
        self.inner.start().await
    }
    async fn stop(&self) -> edda::interfaces::transport::Result<()> {
        self.inner.stop().await
    }
    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn edda::interfaces::transport::DeliveryHandler>,
    ) -> edda::interfaces::transport::Result<()> {
        self.inner.subscribe(options, handler).await
    }
    async fn publish(
        &self,
        envelope: Envelope,
        options: edda::PublishOptions,
    ) -> edda::interfaces::transport::Result<()> {
        if envelope.message_type() == self.target {
            let mut remaining = self.remaining_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Publish("injected publish failure".to_string()));
            }
        }
        self.inner.publish(envelope, options).await
    }
    fn supports_delayed_delivery(&self) -> bool {
        self.inner.supports_delayed_delivery()
    }
}

/// Delegating transport that hides the channel's native delay support, to
/// force the persisted-timeout strategy.
struct NoDelayTransport(Arc<ChannelTransport>);

#[async_trait::async_trait]
impl Transport for NoDelayTransport {
    async fn start(&self) -> edda::interfaces::transport::Result<()> {
        self.0.start().await
    }
    async fn stop(&self) -> edda::interfaces::transport::Result<()> {
        self.0.stop().await
    }
    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn edda::interfaces::transport::DeliveryHandler>,
    ) -> edda::interfaces::transport::Result<()> {
        self.0.subscribe(options, handler).await
    }
    async fn publish(
        &self,
        envelope: Envelope,
        options: edda::PublishOptions,
    ) -> edda::interfaces::transport::Result<()> {
        self.0.publish(envelope, options).await
    }
    fn supports_delayed_delivery(&self) -> bool {
        false
    }
}

// ============================================================================
// Post-commit flush failures
// ============================================================================

/// A transport failure after the state commit must re-emit the buffered
/// side-effects on retry, without re-running the handler. A guarded handler
/// would no longer match the committed state, so recomputing the buffer
/// would silently lose the messages.
#[tokio::test]
async fn flush_failure_after_commit_reemits_buffered_messages() {
    let channel = Arc::new(ChannelTransport::new());
    let transport = Arc::new(FlakyTransport::failing(channel.clone(), "PaymentRecorded", 1));
    let store: Arc<InMemorySagaStore<OrderState>> = Arc::new(InMemorySagaStore::new());

    let handler_runs = Arc::new(AtomicUsize::new(0));
    let runs = handler_runs.clone();
    let saga = SagaBuilder::new("OrderSaga")
        .correlate_start("OrderSubmitted", by_order_id)
        .correlate("*", by_order_id)
        .initial(|_msg, _ctx| {
            Ok(OrderState {
                metadata: SagaMetadata::default(),
                status: "submitted".to_string(),
            })
        })
        .on("PaymentCaptured")
        .when(|state: &OrderState, _| state.status == "submitted")
        .handle(move |_msg, mut state: OrderState, ctx| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                state.status = "paid".to_string();
                let recorded = Message::new(
                    "PaymentRecorded",
                    json!({ "orderId": ctx.correlation_id() }),
                )
                .map_err(|e| HandlerError::Permanent(e.to_string()))?;
                ctx.publish(recorded)?;
                Ok(state)
            }
        })
        .build()
        .unwrap();

    let bus = Bus::builder(transport)
        .with_config(fast_config())
        .register(saga, store.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    let (capture, recorded) = CaptureHandler::new();
    channel
        .subscribe(SubscribeOptions::new("PaymentRecorded", 1), capture)
        .await
        .unwrap();

    bus.publish(order_message("OrderSubmitted", "O-X"))
        .await
        .unwrap();
    wait_for_instance(&store, "OrderSaga", "O-X").await;

    bus.publish(order_message("PaymentCaptured", "O-X"))
        .await
        .unwrap();

    // The first emission is rejected by the transport; the retry must
    // deliver the very message buffered by the committed dispatch
    wait_for_captured(&recorded, 1).await;
    {
        let seen = recorded.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message.field_str("orderId"), Some("O-X"));
    }

    // The handler ran exactly once: only the flush was retried
    assert_eq!(handler_runs.load(Ordering::SeqCst), 1);
    let state = state_of(&store, "OrderSaga", "O-X").await.unwrap();
    assert_eq!(state.status, "paid");
    assert_eq!(state.metadata.version, 1);

    bus.stop().await.unwrap();
}

// ============================================================================
// Error-handler override
// ============================================================================

#[tokio::test]
async fn custom_error_handler_can_drop_failures() {
    use edda::error::{DispatchError, ErrorHandler, ErrorVerdict};

    struct DropEverything;
    impl ErrorHandler for DropEverything {
        fn verdict(&self, _error: &DispatchError, _attempt: u32) -> ErrorVerdict {
            ErrorVerdict::Drop
        }
    }

    let transport = Arc::new(ChannelTransport::new());
    let store: Arc<InMemorySagaStore<OrderState>> = Arc::new(InMemorySagaStore::new());

    let failing_saga = SagaBuilder::new("OrderSaga")
        .correlate_start("OrderSubmitted", by_order_id)
        .initial(|_msg, _ctx| {
            Err(HandlerError::Validation("rejected by policy".to_string()))
        })
        .build()
        .unwrap();

    let bus = Bus::builder(transport.clone())
        .with_config(fast_config())
        .register(failing_saga, store.clone())
        .with_error_handler(Arc::new(DropEverything))
        .build()
        .unwrap();
    bus.start().await.unwrap();

    let (capture, dead_letters) = CaptureHandler::new();
    transport
        .subscribe(
            SubscribeOptions::new(edda::dlq::dlq_endpoint("OrderSubmitted", ".dlq"), 1),
            capture,
        )
        .await
        .unwrap();

    bus.publish(order_message("OrderSubmitted", "O-DROP"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(dead_letters.lock().unwrap().is_empty());
    assert!(store.is_empty().await);

    bus.stop().await.unwrap();
}

// ============================================================================
// Saga-level timeouts
// ============================================================================

#[tokio::test]
async fn saga_level_timeout_expiry_reaches_its_handler() {
    let transport = Arc::new(ChannelTransport::new());
    let store: Arc<InMemorySagaStore<OrderState>> = Arc::new(InMemorySagaStore::new());

    let saga = SagaBuilder::new("OrderSaga")
        .correlate_start("OrderSubmitted", by_order_id)
        .initial(|_msg, _ctx| {
            Ok(OrderState {
                metadata: SagaMetadata::default(),
                status: "submitted".to_string(),
            })
        })
        .on("OrderSubmitted")
        .handle(|_msg, state: OrderState, ctx| async move {
            ctx.set_saga_timeout(Duration::from_millis(100))?;
            Ok(state)
        })
        .on(edda::SAGA_TIMEOUT_EXPIRED)
        .handle(|_msg, mut state: OrderState, ctx| async move {
            state.status = "expired".to_string();
            ctx.complete();
            Ok(state)
        })
        .build()
        .unwrap();

    let bus = Bus::builder(transport)
        .with_config(fast_config())
        .register(saga, store.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    bus.publish(order_message("OrderSubmitted", "O-T"))
        .await
        .unwrap();

    let armed = wait_for_instance(&store, "OrderSaga", "O-T").await;
    assert_eq!(armed.metadata.timeout_ms, Some(100));
    assert!(armed.metadata.timeout_expires_at.is_some());

    let expired = wait_for_completed(&store, "OrderSaga", "O-T").await;
    assert_eq!(expired.status, "expired");
    assert!(expired.metadata.timeout_expires_at.is_none());

    bus.stop().await.unwrap();
}

#[tokio::test]
async fn persisted_timeouts_fire_through_the_reaper() {
    use edda::storage::InMemoryTimeoutStore;

    let channel = Arc::new(ChannelTransport::new());
    let transport = Arc::new(NoDelayTransport(channel));
    let store: Arc<InMemorySagaStore<OrderState>> = Arc::new(InMemorySagaStore::new());

    let saga = SagaBuilder::new("OrderSaga")
        .correlate_start("OrderSubmitted", by_order_id)
        .correlate("*", by_order_id)
        .initial(|_msg, _ctx| {
            Ok(OrderState {
                metadata: SagaMetadata::default(),
                status: "submitted".to_string(),
            })
        })
        .on("OrderSubmitted")
        .handle(|_msg, state: OrderState, ctx| async move {
            let reminder = Message::new(
                "CheckPayment",
                json!({ "orderId": ctx.correlation_id() }),
            )
            .map_err(|e| HandlerError::Permanent(e.to_string()))?;
            ctx.schedule(reminder, Duration::from_millis(60))?;
            Ok(state)
        })
        .on("CheckPayment")
        .handle(|_msg, mut state: OrderState, _ctx| async move {
            state.status = "checked".to_string();
            Ok(state)
        })
        .build()
        .unwrap();

    let bus = Bus::builder(transport)
        .with_config(fast_config())
        .register(saga, store.clone())
        .with_timeout_store(Arc::new(InMemoryTimeoutStore::new()))
        .build()
        .unwrap();
    bus.start().await.unwrap();

    bus.publish(order_message("OrderSubmitted", "O-R"))
        .await
        .unwrap();

    wait_for_status(&store, "OrderSaga", "O-R", "checked").await;

    bus.stop().await.unwrap();
}

// ============================================================================
// Drain behaviour
// ============================================================================

#[tokio::test]
async fn stop_waits_for_in_flight_dispatch() {
    let transport = Arc::new(ChannelTransport::new());
    let store: Arc<InMemorySagaStore<OrderState>> = Arc::new(InMemorySagaStore::new());

    let slow_saga = SagaBuilder::new("OrderSaga")
        .correlate_start("OrderSubmitted", by_order_id)
        .initial(|_msg, _ctx| {
            Ok(OrderState {
                metadata: SagaMetadata::default(),
                status: "submitted".to_string(),
            })
        })
        .on("OrderSubmitted")
        .handle(|_msg, mut state: OrderState, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            state.status = "slow-but-done".to_string();
            Ok(state)
        })
        .build()
        .unwrap();

    let bus = Bus::builder(transport)
        .with_config(fast_config())
        .register(slow_saga, store.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    bus.publish(order_message("OrderSubmitted", "O-S"))
        .await
        .unwrap();

    // Let the dispatch get in flight, then stop: the drain must let it
    // finish and persist
    tokio::time::sleep(Duration::from_millis(30)).await;
    bus.stop().await.unwrap();

    let state = state_of(&store, "OrderSaga", "O-S").await.unwrap();
    assert_eq!(state.status, "slow-but-done");
}

#[tokio::test]
async fn stop_past_deadline_cancels_and_discards() {
    let transport = Arc::new(ChannelTransport::new());
    let store: Arc<InMemorySagaStore<OrderState>> = Arc::new(InMemorySagaStore::new());

    let glacial_saga = SagaBuilder::new("OrderSaga")
        .correlate_start("OrderSubmitted", by_order_id)
        .initial(|_msg, _ctx| {
            Ok(OrderState {
                metadata: SagaMetadata::default(),
                status: "submitted".to_string(),
            })
        })
        .on("OrderSubmitted")
        .handle(|_msg, state: OrderState, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(state)
        })
        .build()
        .unwrap();

    let mut config = fast_config();
    config.worker.shutdown_timeout_ms = 50;

    let bus = Bus::builder(transport)
        .with_config(config)
        .register(glacial_saga, store.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    bus.publish(order_message("OrderSubmitted", "O-G"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The deadline passes mid-handler; the dispatch observes the
    // cancellation before persisting and nacks instead
    bus.stop().await.unwrap();
    assert!(store.is_empty().await);
}
