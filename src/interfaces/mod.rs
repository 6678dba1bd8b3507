//! Abstract contracts consumed by the runtime and implemented externally.
//!
//! Concrete broker and database drivers live outside the core; the in-memory
//! implementations under [`crate::bus::channel`] and [`crate::storage`]
//! serve standalone mode and tests.

pub mod store;
pub mod timeouts;
pub mod transport;

pub use store::{SagaStore, StoreError};
pub use timeouts::{TimeoutRecord, TimeoutStore};
pub use transport::{
    DeliveryHandler, PublishOptions, SubscribeOptions, Transport, TransportError,
};
