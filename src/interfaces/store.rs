//! Saga state persistence interface.

use async_trait::async_trait;
use uuid::Uuid;

use crate::saga::state::SagaState;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("saga not found: saga={saga_name}, id={saga_id}")]
    NotFound { saga_name: String, saga_id: Uuid },

    #[error("duplicate key: saga={saga_name}, key={key}")]
    DuplicateKey { saga_name: String, key: String },

    #[error("version conflict for saga {saga_id}: expected {expected}, stored {actual:?}")]
    Conflict {
        saga_id: Uuid,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("state serialization failed: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Interface for saga state persistence, typed on the user's state.
///
/// A persisted state is uniquely identified by `(saga_name, saga_id)` with a
/// second unique lookup path `(saga_name, correlation_id)`. `version` is the
/// sole concurrency token; implementations must not lock. The metadata block
/// must round-trip unchanged modulo clock resolution.
#[async_trait]
pub trait SagaStore<S: SagaState>: Send + Sync {
    /// Fetch a state by instance id.
    async fn get_by_id(&self, saga_name: &str, saga_id: Uuid) -> Result<Option<S>>;

    /// Fetch a state by its active correlation id.
    async fn get_by_correlation_id(
        &self,
        saga_name: &str,
        correlation_id: &str,
    ) -> Result<Option<S>>;

    /// Insert a new state at version zero.
    ///
    /// Fails with [`StoreError::DuplicateKey`] when either the saga id or
    /// the correlation id already exists for this saga.
    async fn insert(&self, saga_name: &str, correlation_id: &str, state: &S) -> Result<()>;

    /// Replace a state, guarded by the version read before the mutation.
    ///
    /// Fails with [`StoreError::Conflict`] when the stored version no longer
    /// matches `expected_version`, and [`StoreError::NotFound`] when the row
    /// is gone.
    async fn update(&self, saga_name: &str, state: &S, expected_version: u64) -> Result<()>;

    /// Remove a state. Idempotent.
    async fn delete(&self, saga_name: &str, saga_id: Uuid) -> Result<()>;
}
