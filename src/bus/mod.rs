//! The worker/bus: lifecycle, subscriptions, publishing.
//!
//! A [`Bus`] owns the registered saga definitions, the middleware chain, the
//! transport, and the scheduler. `start()` subscribes one endpoint per
//! handled message type; `stop()` drains in-flight dispatches up to the
//! shutdown deadline, then cancels the remainder so the transport
//! redelivers them elsewhere.

#[cfg(feature = "standalone")]
pub mod channel;
mod worker;

#[cfg(feature = "standalone")]
pub use channel::ChannelTransport;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::BusConfig;
use crate::envelope::{Envelope, Message, SAGA_TIMEOUT_EXPIRED};
use crate::error::{DefaultErrorHandler, DispatchError, ErrorHandler};
use crate::interfaces::store::SagaStore;
use crate::interfaces::timeouts::TimeoutStore;
use crate::interfaces::transport::{
    DeliveryHandler, PublishOptions, SubscribeOptions, Transport, TransportError,
};
use crate::middleware::Middleware;
use crate::orchestration::{SagaExecutor, SagaRunner};
use crate::saga::definition::SagaDefinition;
use crate::saga::state::SagaState;
use crate::scheduler::Scheduler;

use worker::WorkerContext;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: WorkerState,
    },

    #[error("saga '{0}' is already registered")]
    DuplicateSaga(String),

    #[error("cannot publish reserved message type '{0}'")]
    ReservedType(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Assembles a [`Bus`].
pub struct BusBuilder {
    transport: Arc<dyn Transport>,
    config: BusConfig,
    timeout_store: Option<Arc<dyn TimeoutStore>>,
    runners: Vec<Arc<dyn SagaRunner>>,
    middleware: Vec<Arc<dyn Middleware>>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl BusBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: BusConfig::default(),
            timeout_store: None,
            runners: Vec::new(),
            middleware: Vec::new(),
            error_handler: Arc::new(DefaultErrorHandler),
        }
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Back the scheduler with persisted timeouts for transports without
    /// native delayed delivery.
    pub fn with_timeout_store(mut self, store: Arc<dyn TimeoutStore>) -> Self {
        self.timeout_store = Some(store);
        self
    }

    /// Register a saga definition with its store.
    pub fn register<S: SagaState>(
        mut self,
        definition: SagaDefinition<S>,
        store: Arc<dyn SagaStore<S>>,
    ) -> Self {
        self.runners.push(Arc::new(SagaExecutor::new(definition, store)));
        self
    }

    /// Append a middleware; the first appended runs outermost.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn build(self) -> Result<Bus> {
        let mut names = HashSet::new();
        for runner in &self.runners {
            if !names.insert(runner.name().to_string()) {
                return Err(BusError::DuplicateSaga(runner.name().to_string()));
            }
        }

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&self.transport),
            self.timeout_store,
            self.config.worker.reaper_poll_interval(),
        ));

        let worker = Arc::new(WorkerContext {
            runners: self.runners,
            middleware: self.middleware,
            transport: self.transport,
            scheduler: Arc::clone(&scheduler),
            config: self.config.worker,
            error_handler: self.error_handler,
            cancel: CancellationToken::new(),
        });

        Ok(Bus {
            inner: Arc::new(BusInner {
                worker,
                scheduler,
                state: Mutex::new(WorkerState::Stopped),
                tracker: TaskTracker::new(),
            }),
        })
    }
}

struct BusInner {
    worker: Arc<WorkerContext>,
    scheduler: Arc<Scheduler>,
    state: Mutex<WorkerState>,
    tracker: TaskTracker,
}

/// Saga bus: subscribe, dispatch, publish.
///
/// Cheap to clone; pass it explicitly rather than through globals.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn builder(transport: Arc<dyn Transport>) -> BusBuilder {
        BusBuilder::new(transport)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    fn transition(
        &self,
        operation: &'static str,
        from: WorkerState,
        to: WorkerState,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().expect("state lock poisoned");
        if *state != from {
            return Err(BusError::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: WorkerState) {
        *self.inner.state.lock().expect("state lock poisoned") = to;
    }

    /// Start the transport and subscribe to every endpoint implied by the
    /// registered sagas, plus the reserved timeout-expiry endpoint.
    pub async fn start(&self) -> Result<()> {
        self.transition("start", WorkerState::Stopped, WorkerState::Starting)?;

        let worker = &self.inner.worker;
        if let Err(e) = worker.transport.start().await {
            self.set_state(WorkerState::Stopped);
            return Err(e.into());
        }

        // One subscription per message type. Where several sagas share a
        // type, the most conservative concurrency override wins.
        let mut endpoints: BTreeMap<String, usize> = BTreeMap::new();
        for runner in &worker.runners {
            let concurrency = worker.config.concurrency_for(runner.name());
            for message_type in runner.handled_message_types() {
                endpoints
                    .entry(message_type.clone())
                    .and_modify(|c| *c = (*c).min(concurrency))
                    .or_insert(concurrency);
            }
        }
        endpoints
            .entry(SAGA_TIMEOUT_EXPIRED.to_string())
            .or_insert(worker.config.default_concurrency);

        for (endpoint, concurrency) in endpoints {
            let handler: Arc<dyn DeliveryHandler> = Arc::new(WorkerDelivery {
                worker: Arc::clone(worker),
                endpoint: endpoint.clone(),
                tracker: self.inner.tracker.clone(),
            });
            let subscribe = worker
                .transport
                .subscribe(SubscribeOptions::new(endpoint, concurrency), handler)
                .await;
            if let Err(e) = subscribe {
                self.set_state(WorkerState::Stopped);
                return Err(e.into());
            }
        }

        Arc::clone(&self.inner.scheduler).start_reaper();
        self.set_state(WorkerState::Running);
        info!(sagas = worker.runners.len(), "Bus started");
        Ok(())
    }

    /// Drain and stop.
    ///
    /// Closes subscriptions, waits for in-flight dispatches up to the
    /// shutdown deadline, then cancels the rest; cancelled dispatches nack
    /// so another consumer can pick their envelopes up.
    pub async fn stop(&self) -> Result<()> {
        self.transition("stop", WorkerState::Running, WorkerState::Stopping)?;

        let worker = &self.inner.worker;
        if let Err(e) = worker.transport.stop().await {
            warn!(error = %e, "Transport stop failed, continuing drain");
        }
        self.inner.scheduler.stop();

        self.inner.tracker.close();
        let deadline = worker.config.shutdown_timeout();
        if tokio::time::timeout(deadline, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                deadline = ?deadline,
                "Drain deadline reached, cancelling in-flight dispatches"
            );
            worker.cancel.cancel();
            self.inner.tracker.wait().await;
        }

        self.set_state(WorkerState::Stopped);
        info!("Bus stopped");
        Ok(())
    }

    /// Publish a message through the transport.
    pub async fn publish(&self, message: Message) -> Result<()> {
        self.publish_with(message, PublishOptions::default()).await
    }

    /// Publish with explicit routing options (endpoint, key, headers,
    /// delay).
    pub async fn publish_with(&self, message: Message, options: PublishOptions) -> Result<()> {
        if message.message_type() == SAGA_TIMEOUT_EXPIRED {
            return Err(BusError::ReservedType(SAGA_TIMEOUT_EXPIRED.to_string()));
        }
        let state = self.state();
        if state != WorkerState::Running {
            return Err(BusError::InvalidState {
                operation: "publish",
                state,
            });
        }

        let envelope = Envelope::new(message);
        self.inner
            .scheduler
            .publish(envelope, options, None)
            .await
            .map_err(|e| match e {
                DispatchError::Transport(t) => BusError::Transport(t),
                other => BusError::Publish(other.to_string()),
            })
    }
}

/// Delivery handler wiring a subscription into the worker, tracking each
/// dispatch for graceful drain.
struct WorkerDelivery {
    worker: Arc<WorkerContext>,
    endpoint: String,
    tracker: TaskTracker,
}

impl DeliveryHandler for WorkerDelivery {
    fn handle(
        &self,
        envelope: Envelope,
    ) -> BoxFuture<'static, std::result::Result<(), TransportError>> {
        let worker = Arc::clone(&self.worker);
        let endpoint = self.endpoint.clone();
        Box::pin(self.tracker.track_future(async move {
            worker::process_delivery(&worker, &endpoint, envelope).await
        }))
    }
}
