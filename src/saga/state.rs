//! Persisted saga state and its mandatory metadata block.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime-owned metadata embedded in every persisted saga state.
///
/// The runtime maintains this block across the saga lifecycle: identity and
/// `created_at` are fixed at insert, `version` increments by exactly one on
/// each successful update, and `updated_at` advances monotonically. Handler
/// edits to this block are overwritten at persist time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaMetadata {
    /// Unique per instance, generated at creation.
    pub saga_id: Uuid,
    /// Optimistic-concurrency token. Zero at creation.
    pub version: u64,
    /// Set once at insert.
    pub created_at: DateTime<Utc>,
    /// Advances on every successful update.
    pub updated_at: DateTime<Utc>,
    /// Terminal flag. Once set, no further mutations are accepted.
    pub is_completed: bool,
    /// Soft-retention marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    /// Distributed-trace continuation recorded at saga birth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,
    /// Active saga-level timeout, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_expires_at: Option<DateTime<Utc>>,
}

impl SagaMetadata {
    /// Fresh metadata for a newly created instance.
    pub fn new(saga_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            saga_id,
            version: 0,
            created_at: now,
            updated_at: now,
            is_completed: false,
            archived_at: None,
            trace_parent: None,
            trace_state: None,
            timeout_ms: None,
            timeout_expires_at: None,
        }
    }
}

impl Default for SagaMetadata {
    /// Placeholder block for state construction in initial-state factories.
    /// The runtime replaces every field before the state is persisted.
    fn default() -> Self {
        Self::new(Uuid::nil(), Utc::now())
    }
}

/// User-defined saga state.
///
/// State types embed a [`SagaMetadata`] block and expose it through the two
/// accessors; everything else is domain data. States round-trip through
/// serde when persisted, so derive `Serialize`/`Deserialize` alongside
/// `Clone`.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct OrderState {
///     metadata: SagaMetadata,
///     status: String,
/// }
///
/// impl SagaState for OrderState {
///     fn metadata(&self) -> &SagaMetadata { &self.metadata }
///     fn metadata_mut(&mut self) -> &mut SagaMetadata { &mut self.metadata }
/// }
/// ```
pub trait SagaState: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The embedded metadata block.
    fn metadata(&self) -> &SagaMetadata;

    /// Mutable access for the runtime's persist path.
    fn metadata_mut(&mut self) -> &mut SagaMetadata;
}
