//! Edda - saga orchestration runtime
//!
//! A durable, message-driven state-machine engine: inbound messages are
//! correlated to long-running saga instances, persisted state is mutated
//! under optimistic concurrency, user handlers run inside a middleware
//! chain, outbound messages are buffered until the state commit, and
//! failures retry with backoff or dead-letter.
//!
//! Transports and stores are abstract contracts ([`interfaces`]); the
//! in-memory implementations behind the `standalone` feature serve local
//! development and tests.

pub mod bus;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod interfaces;
pub mod middleware;
pub mod orchestration;
pub mod saga;
pub mod scheduler;
pub mod storage;
pub mod utils;

pub use bus::{Bus, BusBuilder, BusError, WorkerState};
pub use config::BusConfig;
pub use envelope::{Envelope, Message, SAGA_TIMEOUT_EXPIRED};
pub use error::{Classification, DefaultErrorHandler, ErrorHandler, ErrorVerdict, HandlerError};
pub use interfaces::{PublishOptions, SagaStore, SubscribeOptions, Transport};
pub use middleware::{Middleware, Next, PipelineContext};
pub use saga::{HandlerContext, SagaBuilder, SagaDefinition, SagaMetadata, SagaState};
