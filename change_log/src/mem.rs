//! In-memory implementation of the change store.
//!
//! Useful for testing and for fully local, non-durable deployments. A
//! transaction clones the collections into a stage, mutates the stage, and
//! writes it back on commit while holding the store lock for its whole
//! lifetime, so transactions are serialized and aborts are free.

use crate::core::{
    ChangeStore, IdempotencyRepo, LogRepo, Materializer, StateReader, StoreError, StoreTransaction,
};
use async_trait::async_trait;
use data_types::{Change, EntitySchema, LogEntry, Schema, SequenceNumber};
use lww::EntityState;
use observability_deps::tracing::debug;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct MemCollections {
    next_seq: i64,
    log: Vec<LogEntry>,
    idempotency: BTreeMap<(String, String), i64>,
    tags: BTreeMap<(String, String), EntityState>,
    domain: BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
}

/// An in-memory [`ChangeStore`].
#[derive(Debug, Default)]
pub struct MemStore {
    collections: Arc<Mutex<MemCollections>>,
    schema: Option<Schema>,
}

impl MemStore {
    /// Create a log-only store without a materializer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store materializing into `schema`.
    pub fn with_schema(schema: Schema) -> Self {
        Self {
            collections: Default::default(),
            schema: Some(schema),
        }
    }

    /// The domain-table projection of `(entity, id)`, if present.
    ///
    /// This is the in-memory stand-in for querying a domain table directly.
    pub async fn domain_row(&self, entity: &str, id: &str) -> Option<BTreeMap<String, Value>> {
        let collections = self.collections.lock().await;
        collections
            .domain
            .get(entity)
            .and_then(|rows| rows.get(id))
            .cloned()
    }
}

#[async_trait]
impl ChangeStore for MemStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = Arc::clone(&self.collections).lock_owned().await;
        let stage = guard.clone();
        Ok(Box::new(MemTxn {
            guard,
            stage,
            schema: self.schema.clone(),
        }))
    }

    fn type_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl StateReader for MemStore {
    async fn get(&self, entity: &str, id: &str) -> Result<Option<EntityState>, StoreError> {
        let collections = self.collections.lock().await;
        Ok(collections
            .tags
            .get(&(entity.to_string(), id.to_string()))
            .filter(|state| !state.deleted)
            .cloned())
    }

    async fn get_many(
        &self,
        entity: &str,
        ids: &[&str],
    ) -> Result<Vec<(String, EntityState)>, StoreError> {
        let collections = self.collections.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                collections
                    .tags
                    .get(&(entity.to_string(), id.to_string()))
                    .filter(|state| !state.deleted)
                    .map(|state| (id.to_string(), state.clone()))
            })
            .collect())
    }

    async fn list(&self, entity: &str) -> Result<Vec<(String, EntityState)>, StoreError> {
        let collections = self.collections.lock().await;
        Ok(collections
            .tags
            .iter()
            .filter(|((e, _), state)| e == entity && !state.deleted)
            .map(|((_, id), state)| (id.clone(), state.clone()))
            .collect())
    }
}

/// A transaction over a [`MemStore`].
///
/// Holds the store lock for its lifetime; `commit` writes the stage back,
/// dropping (or aborting) discards it.
#[derive(Debug)]
struct MemTxn {
    guard: OwnedMutexGuard<MemCollections>,
    stage: MemCollections,
    schema: Option<Schema>,
}

impl MemTxn {
    fn entity_schema(&self, entity: &str) -> Result<EntitySchema, StoreError> {
        self.schema
            .as_ref()
            .and_then(|schema| schema.entity(entity))
            .cloned()
            .ok_or_else(|| StoreError::unknown_entity(entity))
    }

}

// The id column comes from the entity id; fields without a domain column
// keep whatever the row held before.
fn project_row(
    entity_schema: &EntitySchema,
    row: &mut BTreeMap<String, Value>,
    values: &BTreeMap<String, Value>,
) {
    for field in entity_schema.fields() {
        if field.name() == "id" {
            continue;
        }
        if let Some(value) = values.get(field.name()) {
            row.insert(field.name().to_string(), value.clone());
        }
    }
}

#[async_trait]
impl StoreTransaction for MemTxn {
    fn log(&mut self) -> &mut dyn LogRepo {
        self
    }

    fn idempotency(&mut self) -> &mut dyn IdempotencyRepo {
        self
    }

    fn materializer(&mut self) -> Option<&mut dyn Materializer> {
        if self.schema.is_some() {
            Some(self)
        } else {
            None
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self {
            mut guard, stage, ..
        } = *self;
        *guard = stage;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        debug!("mem transaction aborted");
        Ok(())
    }
}

#[async_trait]
impl LogRepo for MemTxn {
    async fn append(
        &mut self,
        stream: &str,
        change: &Change,
    ) -> Result<SequenceNumber, StoreError> {
        self.stage.next_seq += 1;
        let seq = SequenceNumber::new(self.stage.next_seq);
        self.stage.log.push(LogEntry {
            seq,
            stream: stream.to_string(),
            change: change.clone(),
        });
        Ok(seq)
    }

    async fn pull(
        &mut self,
        stream: &str,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        // the log vector is seq-ascending by construction
        Ok(self
            .stage
            .log
            .iter()
            .filter(|entry| entry.stream == stream && entry.seq > after)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdempotencyRepo for MemTxn {
    async fn last_seq(
        &mut self,
        stream: &str,
        key: &str,
    ) -> Result<Option<SequenceNumber>, StoreError> {
        Ok(self
            .stage
            .idempotency
            .get(&(stream.to_string(), key.to_string()))
            .map(|seq| SequenceNumber::new(*seq)))
    }

    async fn create(&mut self, stream: &str, key: &str) -> Result<(), StoreError> {
        let slot = (stream.to_string(), key.to_string());
        if self.stage.idempotency.contains_key(&slot) {
            return Err(StoreError::append_failed(format!(
                "idempotency key {key:?} already recorded for stream {stream:?}"
            )));
        }
        self.stage.idempotency.insert(slot, 0);
        Ok(())
    }

    async fn set_last_seq(
        &mut self,
        stream: &str,
        key: &str,
        seq: SequenceNumber,
    ) -> Result<(), StoreError> {
        self.stage
            .idempotency
            .insert((stream.to_string(), key.to_string()), seq.get());
        Ok(())
    }
}

#[async_trait]
impl Materializer for MemTxn {
    async fn load(&mut self, entity: &str, id: &str) -> Result<Option<EntityState>, StoreError> {
        Ok(self
            .stage
            .tags
            .get(&(entity.to_string(), id.to_string()))
            .cloned())
    }

    async fn save(
        &mut self,
        entity: &str,
        id: &str,
        state: &EntityState,
    ) -> Result<(), StoreError> {
        let entity_schema = self.entity_schema(entity)?;

        self.stage
            .tags
            .insert((entity.to_string(), id.to_string()), state.clone());

        let mut row = self
            .stage
            .domain
            .get(entity)
            .and_then(|rows| rows.get(id))
            .cloned()
            .unwrap_or_default();
        project_row(&entity_schema, &mut row, &state.values);
        self.stage
            .domain
            .entry(entity.to_string())
            .or_default()
            .insert(id.to_string(), row);
        Ok(())
    }

    async fn remove(
        &mut self,
        entity: &str,
        id: &str,
        state: &EntityState,
    ) -> Result<(), StoreError> {
        self.entity_schema(entity)?;

        self.stage
            .tags
            .insert((entity.to_string(), id.to_string()), state.clone());

        // this backend drops the domain row for tombstoned entities
        if let Some(rows) = self.stage.domain.get_mut(entity) {
            rows.remove(id);
        }
        Ok(())
    }

    async fn save_entity(
        &mut self,
        entity: &str,
        id: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        let entity_schema = self.entity_schema(entity)?;

        let mut row = self
            .stage
            .domain
            .get(entity)
            .and_then(|rows| rows.get(id))
            .cloned()
            .unwrap_or_default();
        project_row(&entity_schema, &mut row, values);
        self.stage
            .domain
            .entry(entity.to_string())
            .or_default()
            .insert(id.to_string(), row);
        Ok(())
    }
}
