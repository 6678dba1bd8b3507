//! In-memory store implementations for standalone mode and testing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::interfaces::store::{Result, SagaStore, StoreError};
use crate::interfaces::timeouts::{TimeoutRecord, TimeoutStore};
use crate::saga::state::SagaState;

struct Tables<S> {
    /// Rows keyed by `(saga_name, saga_id)`.
    rows: HashMap<(String, Uuid), S>,
    /// Unique lookup path `(saga_name, correlation_id) -> saga_id`.
    correlations: HashMap<(String, String), Uuid>,
}

impl<S> Default for Tables<S> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            correlations: HashMap::new(),
        }
    }
}

/// Saga store backed by process memory.
///
/// Full optimistic-concurrency semantics under a single lock, plus failure
/// toggles for exercising retry paths in tests.
pub struct InMemorySagaStore<S: SagaState> {
    tables: RwLock<Tables<S>>,
    fail_on_update: RwLock<bool>,
}

impl<S: SagaState> InMemorySagaStore<S> {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            fail_on_update: RwLock::new(false),
        }
    }

    /// Make every `update` fail with a backend error until reset.
    pub async fn set_fail_on_update(&self, fail: bool) {
        *self.fail_on_update.write().await = fail;
    }

    /// Number of stored instances, completed ones included.
    pub async fn len(&self) -> usize {
        self.tables.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<S: SagaState> Default for InMemorySagaStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: SagaState> SagaStore<S> for InMemorySagaStore<S> {
    async fn get_by_id(&self, saga_name: &str, saga_id: Uuid) -> Result<Option<S>> {
        let tables = self.tables.read().await;
        Ok(tables
            .rows
            .get(&(saga_name.to_string(), saga_id))
            .cloned())
    }

    async fn get_by_correlation_id(
        &self,
        saga_name: &str,
        correlation_id: &str,
    ) -> Result<Option<S>> {
        let tables = self.tables.read().await;
        let Some(saga_id) = tables
            .correlations
            .get(&(saga_name.to_string(), correlation_id.to_string()))
        else {
            return Ok(None);
        };
        Ok(tables.rows.get(&(saga_name.to_string(), *saga_id)).cloned())
    }

    async fn insert(&self, saga_name: &str, correlation_id: &str, state: &S) -> Result<()> {
        let saga_id = state.metadata().saga_id;
        let mut tables = self.tables.write().await;

        let row_key = (saga_name.to_string(), saga_id);
        if tables.rows.contains_key(&row_key) {
            return Err(StoreError::DuplicateKey {
                saga_name: saga_name.to_string(),
                key: saga_id.to_string(),
            });
        }
        let correlation_key = (saga_name.to_string(), correlation_id.to_string());
        if tables.correlations.contains_key(&correlation_key) {
            return Err(StoreError::DuplicateKey {
                saga_name: saga_name.to_string(),
                key: correlation_id.to_string(),
            });
        }

        tables.rows.insert(row_key, state.clone());
        tables.correlations.insert(correlation_key, saga_id);
        Ok(())
    }

    async fn update(&self, saga_name: &str, state: &S, expected_version: u64) -> Result<()> {
        if *self.fail_on_update.read().await {
            return Err(StoreError::Backend("injected update failure".to_string()));
        }

        let saga_id = state.metadata().saga_id;
        let mut tables = self.tables.write().await;
        let row_key = (saga_name.to_string(), saga_id);
        let Some(stored) = tables.rows.get_mut(&row_key) else {
            return Err(StoreError::NotFound {
                saga_name: saga_name.to_string(),
                saga_id,
            });
        };

        let stored_version = stored.metadata().version;
        if stored_version != expected_version {
            return Err(StoreError::Conflict {
                saga_id,
                expected: expected_version,
                actual: Some(stored_version),
            });
        }

        *stored = state.clone();
        Ok(())
    }

    async fn delete(&self, saga_name: &str, saga_id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.rows.remove(&(saga_name.to_string(), saga_id)).is_some() {
            tables
                .correlations
                .retain(|(name, _), id| !(name == saga_name && *id == saga_id));
        }
        Ok(())
    }
}

/// Timeout store backed by process memory.
#[derive(Default)]
pub struct InMemoryTimeoutStore {
    records: RwLock<HashMap<Uuid, TimeoutRecord>>,
}

impl InMemoryTimeoutStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimeoutStore for InMemoryTimeoutStore {
    async fn insert(&self, record: TimeoutRecord) -> Result<()> {
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TimeoutRecord>> {
        let records = self.records.read().await;
        let mut due: Vec<TimeoutRecord> = records
            .values()
            .filter(|r| r.fire_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.fire_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.records.write().await.remove(&id);
        Ok(())
    }
}
