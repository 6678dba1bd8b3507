//! Shared fixtures for the acceptance and runtime test suites.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;

use edda::envelope::{Envelope, Message};
use edda::interfaces::store::SagaStore;
use edda::interfaces::transport::DeliveryHandler;
use edda::saga::{SagaBuilder, SagaDefinition, SagaMetadata, SagaState};
use edda::storage::InMemorySagaStore;
use edda::BusConfig;

const POLL: Duration = Duration::from_millis(5);
const POLL_ROUNDS: usize = 400;

/// The order saga state used across scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub metadata: SagaMetadata,
    pub status: String,
}

impl SagaState for OrderState {
    fn metadata(&self) -> &SagaMetadata {
        &self.metadata
    }
    fn metadata_mut(&mut self) -> &mut SagaMetadata {
        &mut self.metadata
    }
}

pub fn by_order_id(message: &Message) -> Option<String> {
    message.field_str("orderId").map(str::to_string)
}

/// Order saga: started by `OrderSubmitted`, wildcard-correlated on every
/// other type by order id, completed by `ShipmentCreated`.
pub fn order_saga() -> SagaDefinition<OrderState> {
    SagaBuilder::new("OrderSaga")
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
        .handle(|_msg, mut state: OrderState, _ctx| async move {
            state.status = "paid".to_string();
            Ok(state)
        })
        .on("InventoryReserved")
        .when(|state: &OrderState, _| state.status == "paid")
        .handle(|_msg, mut state: OrderState, _ctx| async move {
            state.status = "reserved".to_string();
            Ok(state)
        })
        .on("ShipmentCreated")
        .handle(|_msg, mut state: OrderState, ctx| async move {
            state.status = "shipped".to_string();
            ctx.complete();
            Ok(state)
        })
        .build()
        .expect("order saga builds")
}

/// Message helper.
pub fn order_message(message_type: &str, order_id: &str) -> Message {
    Message::new(message_type, json!({ "orderId": order_id })).expect("valid message")
}

/// Worker config tuned for fast tests: short backoff, loose timeout bounds.
pub fn fast_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.worker.retry.base_delay_ms = 10;
    config.worker.retry.max_delay_ms = 50;
    config.worker.timeout_bounds.min_ms = 10;
    config.worker.reaper_poll_interval_ms = 20;
    config
}

/// Transport handler capturing everything delivered to an endpoint.
pub struct CaptureHandler {
    seen: Arc<Mutex<Vec<Envelope>>>,
}

impl CaptureHandler {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<Envelope>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self { seen: seen.clone() }),
            seen,
        )
    }
}

impl DeliveryHandler for CaptureHandler {
    fn handle(
        &self,
        envelope: Envelope,
    ) -> BoxFuture<'static, edda::interfaces::transport::Result<()>> {
        let seen = self.seen.clone();
        Box::pin(async move {
            seen.lock().unwrap().push(envelope);
            Ok(())
        })
    }
}

pub async fn state_of(
    store: &InMemorySagaStore<OrderState>,
    saga: &str,
    correlation_id: &str,
) -> Option<OrderState> {
    store
        .get_by_correlation_id(saga, correlation_id)
        .await
        .unwrap()
}

/// Poll until the instance exists, then return it.
pub async fn wait_for_instance(
    store: &InMemorySagaStore<OrderState>,
    saga: &str,
    correlation_id: &str,
) -> OrderState {
    for _ in 0..POLL_ROUNDS {
        if let Some(state) = state_of(store, saga, correlation_id).await {
            return state;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("saga instance {saga}/{correlation_id} never appeared");
}

/// Poll until the instance reaches a status, then return it.
pub async fn wait_for_status(
    store: &InMemorySagaStore<OrderState>,
    saga: &str,
    correlation_id: &str,
    status: &str,
) -> OrderState {
    for _ in 0..POLL_ROUNDS {
        if let Some(state) = state_of(store, saga, correlation_id).await {
            if state.status == status {
                return state;
            }
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("saga {saga}/{correlation_id} never reached status '{status}'");
}

/// Poll until the instance is completed, then return it.
pub async fn wait_for_completed(
    store: &InMemorySagaStore<OrderState>,
    saga: &str,
    correlation_id: &str,
) -> OrderState {
    for _ in 0..POLL_ROUNDS {
        if let Some(state) = state_of(store, saga, correlation_id).await {
            if state.metadata.is_completed {
                return state;
            }
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("saga {saga}/{correlation_id} never completed");
}

/// Poll until at least `count` envelopes were captured.
pub async fn wait_for_captured(seen: &Arc<Mutex<Vec<Envelope>>>, count: usize) {
    for _ in 0..POLL_ROUNDS {
        if seen.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("expected {count} captured envelopes");
}
