//! Persisted timeout records for transports without native delay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::Result;
use super::transport::PublishOptions;
use crate::envelope::Envelope;

/// A delayed self-message awaiting its fire time.
#[derive(Debug, Clone)]
pub struct TimeoutRecord {
    /// Record identity, used to ack after publishing.
    pub id: Uuid,
    /// Owning saga, for diagnostics and cleanup.
    pub saga_name: String,
    pub saga_id: Uuid,
    /// Earliest delivery time.
    pub fire_at: DateTime<Utc>,
    /// The envelope to publish when due.
    pub envelope: Envelope,
    /// Publish routing, with the delay already consumed into `fire_at`.
    pub options: PublishOptions,
}

/// Interface for timeout persistence.
///
/// Backs the scheduler's fallback strategy: records are inserted at schedule
/// time and drained by a reaper that publishes everything due. The reaper
/// removes each record only after a successful publish, so delivery is
/// at-least-once.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Persist a pending timeout.
    async fn insert(&self, record: TimeoutRecord) -> Result<()>;

    /// Fetch records with `fire_at <= now`, oldest first, up to `limit`.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TimeoutRecord>>;

    /// Ack a published record. Idempotent.
    async fn remove(&self, id: Uuid) -> Result<()>;
}
