//! Acceptance tests using cucumber-rs (Gherkin).
//!
//! Scenario-driven conformance suite over the in-memory transport and
//! stores: saga lifecycle, optimistic-concurrency convergence, correlation
//! failure policies, retry/dead-letter routing, and scheduled timeouts.
//! Human-readable scenarios live under `features/`; the step definitions
//! below wire them to the runtime.

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cucumber::{given, then, when, World};
use serde_json::json;

use edda::bus::ChannelTransport;
use edda::dlq;
use edda::envelope::{Envelope, Message};
use edda::error::HandlerError;
use edda::interfaces::transport::{SubscribeOptions, Transport};
use edda::saga::{SagaBuilder, SagaDefinition, SagaMetadata};
use edda::storage::InMemorySagaStore;
use edda::Bus;

use common::{
    by_order_id, fast_config, order_message, order_saga, state_of, wait_for_captured,
    wait_for_completed, wait_for_instance, wait_for_status, CaptureHandler, OrderState,
};

/// Test world containing all test state.
#[derive(World)]
#[world(init = Self::new)]
pub struct SagaWorld {
    transport: Arc<ChannelTransport>,
    order_store: Arc<InMemorySagaStore<OrderState>>,
    inventory_store: Arc<InMemorySagaStore<OrderState>>,
    bus: Option<Bus>,
    dead_letters: Arc<Mutex<Vec<Envelope>>>,
    handler_runs: Arc<AtomicUsize>,
}

impl std::fmt::Debug for SagaWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaWorld")
            .field("bus_running", &self.bus.is_some())
            .finish()
    }
}

impl SagaWorld {
    async fn new() -> Self {
        Self {
            transport: Arc::new(ChannelTransport::new()),
            order_store: Arc::new(InMemorySagaStore::new()),
            inventory_store: Arc::new(InMemorySagaStore::new()),
            bus: None,
            dead_letters: Arc::new(Mutex::new(Vec::new())),
            handler_runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn start_bus(&mut self, builder: edda::BusBuilder) {
        let bus = builder.build().expect("bus builds");
        bus.start().await.expect("bus starts");
        self.bus = Some(bus);
    }

    fn bus(&self) -> &Bus {
        self.bus.as_ref().expect("bus is running")
    }

    fn initial_order_state() -> OrderState {
        OrderState {
            metadata: SagaMetadata::default(),
            status: "submitted".to_string(),
        }
    }

    fn inventory_saga() -> SagaDefinition<OrderState> {
        SagaBuilder::new("InventorySaga")
            .correlate_start("OrderSubmitted", by_order_id)
            .initial(|_msg, _ctx| {
                Ok(OrderState {
                    metadata: SagaMetadata::default(),
                    status: "allocating".to_string(),
                })
            })
            .build()
            .expect("inventory saga builds")
    }
}

// ============================================================================
// Given: bus wiring
// ============================================================================

#[given(expr = "a running bus with the order saga")]
async fn given_order_bus(world: &mut SagaWorld) {
    let builder = Bus::builder(world.transport.clone())
        .with_config(fast_config())
        .register(order_saga(), world.order_store.clone());
    world.start_bus(builder).await;
}

#[given(expr = "a running bus with the order saga and the inventory saga")]
async fn given_two_saga_bus(world: &mut SagaWorld) {
    let builder = Bus::builder(world.transport.clone())
        .with_config(fast_config())
        .register(order_saga(), world.order_store.clone())
        .register(SagaWorld::inventory_saga(), world.inventory_store.clone());
    world.start_bus(builder).await;
}

#[given(expr = "a running bus with the order saga and a broken inventory saga")]
async fn given_broken_inventory_bus(world: &mut SagaWorld) {
    let broken = SagaBuilder::new("InventorySaga")
        .correlate_start("OrderSubmitted", by_order_id)
        .initial(|_msg, _ctx| {
            Err(HandlerError::Permanent(
                "allocation table offline".to_string(),
            ))
        })
        .build()
        .expect("broken inventory saga builds");

    let builder = Bus::builder(world.transport.clone())
        .with_config(fast_config())
        .register(order_saga(), world.order_store.clone())
        .register(broken, world.inventory_store.clone());
    world.start_bus(builder).await;
}

#[given(expr = "a bus whose order handler always fails transiently, allowing {int} attempts")]
async fn given_failing_bus(world: &mut SagaWorld, max_attempts: u32) {
    let runs = world.handler_runs.clone();
    let failing = SagaBuilder::new("OrderSaga")
        .correlate_start("OrderSubmitted", by_order_id)
        .initial(|_msg, _ctx| Ok(SagaWorld::initial_order_state()))
        .on("OrderSubmitted")
        .handle(move |_msg, _state: OrderState, _ctx| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Transient("downstream unavailable".to_string()))
            }
        })
        .build()
        .expect("failing saga builds");

    let mut config = fast_config();
    config.worker.retry.max_attempts = max_attempts;

    let builder = Bus::builder(world.transport.clone())
        .with_config(config)
        .register(failing, world.order_store.clone());
    world.start_bus(builder).await;
}

#[given(expr = "a running bus with the order saga and correlation failures routed to the dlq")]
async fn given_dlq_policy_bus(world: &mut SagaWorld) {
    let mut config = fast_config();
    config.worker.on_correlation_failure = edda::config::CorrelationFailurePolicy::Dlq;

    let builder = Bus::builder(world.transport.clone())
        .with_config(config)
        .register(order_saga(), world.order_store.clone());
    world.start_bus(builder).await;
}

#[given(expr = "a running bus with the payment-timeout saga")]
async fn given_timeout_bus(world: &mut SagaWorld) {
    let saga = SagaBuilder::new("OrderSaga")
        .correlate_start("OrderSubmitted", by_order_id)
        .correlate("*", by_order_id)
        .initial(|_msg, _ctx| Ok(SagaWorld::initial_order_state()))
        .on("OrderSubmitted")
        .handle(|_msg, state: OrderState, ctx| async move {
            let reminder = Message::new(
                "PaymentTimeout",
                json!({ "orderId": ctx.correlation_id() }),
            )
            .map_err(|e| HandlerError::Permanent(e.to_string()))?;
            ctx.schedule(reminder, Duration::from_millis(80))?;
            Ok(state)
        })
        .on("PaymentTimeout")
        .when(|state: &OrderState, _| state.status == "submitted")
        .handle(|_msg, mut state: OrderState, _ctx| async move {
            state.status = "payment-timed-out".to_string();
            Ok(state)
        })
        .build()
        .expect("timeout saga builds");

    let builder = Bus::builder(world.transport.clone())
        .with_config(fast_config())
        .register(saga, world.order_store.clone());
    world.start_bus(builder).await;
}

#[given(expr = "a subscription on the dead-letter endpoint for {string}")]
async fn given_dlq_subscription(world: &mut SagaWorld, endpoint: String) {
    let (capture, seen) = CaptureHandler::new();
    world
        .transport
        .subscribe(
            SubscribeOptions::new(dlq::dlq_endpoint(&endpoint, ".dlq"), 1),
            capture,
        )
        .await
        .expect("dlq subscription registers");
    world.dead_letters = seen;
}

// ============================================================================
// When: publishing
// ============================================================================

#[when(expr = "{string} is published for order {string}")]
async fn when_publish(world: &mut SagaWorld, message_type: String, order_id: String) {
    world
        .bus()
        .publish(order_message(&message_type, &order_id))
        .await
        .expect("publish succeeds");
}

#[when(expr = "two concurrent {string} envelopes are published for order {string}")]
async fn when_publish_twice(world: &mut SagaWorld, message_type: String, order_id: String) {
    for _ in 0..2 {
        world
            .bus()
            .publish(order_message(&message_type, &order_id))
            .await
            .expect("publish succeeds");
    }
}

// ============================================================================
// Then: saga state
// ============================================================================

#[then(expr = "the order saga state for {string} has status {string} at version {int}")]
async fn then_order_status(world: &mut SagaWorld, order_id: String, status: String, version: u64) {
    let state = wait_for_status(&world.order_store, "OrderSaga", &order_id, &status).await;
    assert_eq!(state.metadata.version, version);
}

#[then(expr = "the order saga state for {string} stays at version {int}")]
async fn then_order_version_stays(world: &mut SagaWorld, order_id: String, version: u64) {
    // Let any losing dispatch settle before checking
    tokio::time::sleep(Duration::from_millis(200)).await;
    let state = state_of(&world.order_store, "OrderSaga", &order_id)
        .await
        .expect("instance exists");
    assert_eq!(state.metadata.version, version);
}

#[then(expr = "the order saga instance for {string} is completed")]
async fn then_order_completed(world: &mut SagaWorld, order_id: String) {
    wait_for_completed(&world.order_store, "OrderSaga", &order_id).await;
}

#[then(expr = "no order saga instance exists for {string}")]
async fn then_no_order_instance(world: &mut SagaWorld, order_id: String) {
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        state_of(&world.order_store, "OrderSaga", &order_id)
            .await
            .is_none(),
        "unexpected instance for {order_id}"
    );
}

#[then(expr = "the inventory saga state for {string} has status {string} at version {int}")]
async fn then_inventory_status(
    world: &mut SagaWorld,
    order_id: String,
    status: String,
    version: u64,
) {
    let state = wait_for_status(&world.inventory_store, "InventorySaga", &order_id, &status).await;
    assert_eq!(state.metadata.version, version);
}

#[then(expr = "no inventory saga instance exists for {string}")]
async fn then_no_inventory_instance(world: &mut SagaWorld, order_id: String) {
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        state_of(&world.inventory_store, "InventorySaga", &order_id)
            .await
            .is_none(),
        "unexpected inventory instance for {order_id}"
    );
}

#[then(expr = "the order and inventory instances for {string} have different saga ids")]
async fn then_distinct_saga_ids(world: &mut SagaWorld, order_id: String) {
    let order = wait_for_instance(&world.order_store, "OrderSaga", &order_id).await;
    let inventory = wait_for_instance(&world.inventory_store, "InventorySaga", &order_id).await;
    assert_ne!(order.metadata.saga_id, inventory.metadata.saga_id);
}

// ============================================================================
// Then: dead letters and retries
// ============================================================================

#[then(expr = "a dead letter arrives with reason {string} and attempt count {int}")]
async fn then_dead_letter_with_attempts(world: &mut SagaWorld, reason: String, attempts: u32) {
    wait_for_captured(&world.dead_letters, 1).await;
    let dead = world.dead_letters.lock().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0]
            .headers
            .get(dlq::FAILURE_REASON_HEADER)
            .map(String::as_str),
        Some(reason.as_str())
    );
    assert_eq!(
        dead[0].headers.get(dlq::ATTEMPTS_HEADER).map(String::as_str),
        Some(attempts.to_string().as_str())
    );
}

#[then(expr = "a dead letter arrives with reason {string}")]
async fn then_dead_letter(world: &mut SagaWorld, reason: String) {
    wait_for_captured(&world.dead_letters, 1).await;
    let dead = world.dead_letters.lock().unwrap();
    assert_eq!(
        dead[0]
            .headers
            .get(dlq::FAILURE_REASON_HEADER)
            .map(String::as_str),
        Some(reason.as_str())
    );
}

#[then(expr = "the dead letter carries the original {string} payload for order {string}")]
async fn then_dead_letter_payload(world: &mut SagaWorld, message_type: String, order_id: String) {
    wait_for_captured(&world.dead_letters, 1).await;
    let dead = world.dead_letters.lock().unwrap();
    assert_eq!(dead[0].message_type(), message_type);
    assert_eq!(
        dead[0].message.field_str("orderId"),
        Some(order_id.as_str())
    );
}

#[then(expr = "the order handler ran {int} times")]
async fn then_handler_runs(world: &mut SagaWorld, runs: usize) {
    // Settle first so a stray extra attempt would be caught
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(world.handler_runs.load(Ordering::SeqCst), runs);
}

#[tokio::main]
async fn main() {
    SagaWorld::cucumber().run("tests/acceptance/features").await;
}
