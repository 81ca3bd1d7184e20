//! Traits and shared types for change-log backends.
//!
//! A backend provides the append-only per-stream log, the idempotency table,
//! and (optionally) the materializer that keeps the derived per-entity state
//! up to date. All three surfaces are exposed through one
//! [`StoreTransaction`] so the coordinator can bind them into a single atomic
//! unit.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

use async_trait::async_trait;
use data_types::{Change, LogEntry, SequenceNumber};
use lww::EntityState;
use serde_json::Value;

/// Generic boxed error type that is used in this crate.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// backend implementations.
#[derive(Debug)]
pub struct StoreError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: StoreErrorKind,
}

impl StoreError {
    /// Wrap `e` with an explicit kind.
    pub fn new(
        kind: StoreErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// A change failed its structural invariants.
    pub fn invalid_change(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StoreErrorKind::InvalidChange, e)
    }

    /// A domain-table write referenced an entity the schema does not know.
    pub fn unknown_entity(entity: &str) -> Self {
        Self::new(
            StoreErrorKind::UnknownEntity,
            format!("entity {entity:?} is not present in the schema"),
        )
    }

    /// The log rejected an append.
    pub fn append_failed(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StoreErrorKind::AppendFailed, e)
    }

    /// The log could not serve a pull.
    pub fn pull_failed(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StoreErrorKind::PullFailed, e)
    }

    /// The merge output could not be persisted.
    pub fn materialize_failed(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StoreErrorKind::MaterializeFailed, e)
    }

    /// The surrounding transaction was rolled back; no partial effects
    /// remain.
    pub fn transaction_aborted(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StoreErrorKind::TransactionAborted, e)
    }

    /// Something else went wrong.
    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StoreErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self {
            inner: Box::new(e),
            kind: StoreErrorKind::IO,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self {
            inner: Box::new(e),
            kind: StoreErrorKind::IO,
        }
    }
}

impl From<String> for StoreError {
    fn from(e: String) -> Self {
        Self {
            inner: e.into(),
            kind: StoreErrorKind::Unknown,
        }
    }
}

impl From<&'static str> for StoreError {
    fn from(e: &'static str) -> Self {
        Self {
            inner: e.into(),
            kind: StoreErrorKind::Unknown,
        }
    }
}

/// Classification of [`StoreError`]s, mirroring the kernel error taxonomy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// A change violated its structural invariants.
    InvalidChange,

    /// A domain-table write was attempted for an entity missing from the
    /// schema descriptor.
    UnknownEntity,

    /// The log rejected an append; the transaction was rolled back.
    AppendFailed,

    /// A pull could not be served; the stream is intact.
    PullFailed,

    /// The merge output could not be persisted.
    MaterializeFailed,

    /// Umbrella for any commit-time failure; the caller sees a single
    /// failure with no partial effects.
    TransactionAborted,

    /// A fatal IO error occurred.
    IO,

    /// This operation failed for an unknown reason.
    Unknown,
}

/// A backend hosting the change log, the idempotency table and (optionally)
/// the materialized state.
#[async_trait]
pub trait ChangeStore: Sync + Send + Debug + 'static {
    /// Open a transaction covering every repository of this store.
    ///
    /// Dropping the returned transaction without calling
    /// [`commit`](StoreTransaction::commit) discards all of its effects.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Return type (like `"memory"` or `"sqlite"`) of this store.
    fn type_name(&self) -> &'static str;
}

/// One atomic unit of work against a [`ChangeStore`].
///
/// The accessors hand out repository views of the same underlying
/// transaction; nothing becomes visible to other callers until `commit`
/// returns.
#[async_trait]
pub trait StoreTransaction: Send + Debug {
    /// The append-only log.
    fn log(&mut self) -> &mut dyn LogRepo;

    /// The idempotency-key table.
    fn idempotency(&mut self) -> &mut dyn IdempotencyRepo;

    /// The materializer, if this store keeps derived state.
    fn materializer(&mut self) -> Option<&mut dyn Materializer>;

    /// Make every effect of this transaction durable.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every effect of this transaction.
    async fn abort(self: Box<Self>) -> Result<(), StoreError>;
}

/// The append-only per-stream log, ordered by sequence number.
#[async_trait]
pub trait LogRepo: Send + Debug {
    /// Append one change to `stream`, assigning the next sequence number.
    async fn append(&mut self, stream: &str, change: &Change)
        -> Result<SequenceNumber, StoreError>;

    /// The entries of `stream` with `seq > after`, ascending, at most
    /// `limit`.
    async fn pull(
        &mut self,
        stream: &str,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError>;
}

/// The `(stream, idempotency_key) -> last_seq` table making appends
/// at-most-once.
///
/// Uniqueness is the backend's job (a composite primary key, not an
/// application-level check).
#[async_trait]
pub trait IdempotencyRepo: Send + Debug {
    /// The recorded `last_seq` for `(stream, key)`, if the key was seen.
    async fn last_seq(
        &mut self,
        stream: &str,
        key: &str,
    ) -> Result<Option<SequenceNumber>, StoreError>;

    /// Record `(stream, key)` with `last_seq = 0`.
    async fn create(&mut self, stream: &str, key: &str) -> Result<(), StoreError>;

    /// Update the recorded `last_seq` for `(stream, key)`.
    async fn set_last_seq(
        &mut self,
        stream: &str,
        key: &str,
        seq: SequenceNumber,
    ) -> Result<(), StoreError>;
}

/// Applies merged state to the two-table layout: the `ripple_tags` table
/// (authoritative merge metadata) plus one domain table per entity
/// (projection of the latest values).
///
/// Materializers run strictly inside the transaction that owns them and
/// never open transactions of their own.
#[async_trait]
pub trait Materializer: Send + Debug {
    /// Load the current state of `(entity, id)`, tombstoned or not.
    async fn load(&mut self, entity: &str, id: &str) -> Result<Option<EntityState>, StoreError>;

    /// Upsert both the tags row and the domain row for `(entity, id)`.
    ///
    /// Fields without a domain column keep whatever the column held before.
    async fn save(
        &mut self,
        entity: &str,
        id: &str,
        state: &EntityState,
    ) -> Result<(), StoreError>;

    /// Mark `(entity, id)` tombstoned. Whether the domain row is deleted or
    /// retained is backend-specific but consistent per backend.
    async fn remove(
        &mut self,
        entity: &str,
        id: &str,
        state: &EntityState,
    ) -> Result<(), StoreError>;

    /// Upsert only the domain row, leaving the merge metadata untouched.
    async fn save_entity(
        &mut self,
        entity: &str,
        id: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError>;
}

/// Read access to the live materialized state, with tombstoned rows
/// filtered out.
#[async_trait]
pub trait StateReader: Sync + Send + Debug + 'static {
    /// The live state of `(entity, id)`, or `None` if absent or tombstoned.
    async fn get(&self, entity: &str, id: &str) -> Result<Option<EntityState>, StoreError>;

    /// The live states for the given ids, in input order, skipping misses.
    async fn get_many(
        &self,
        entity: &str,
        ids: &[&str],
    ) -> Result<Vec<(String, EntityState)>, StoreError>;

    /// All live states of `entity`, ordered by id.
    async fn list(&self, entity: &str) -> Result<Vec<(String, EntityState)>, StoreError>;
}

pub mod test_utils {
    //! Generic tests for all change-store implementations.

    use super::{ChangeStore, StateReader, StoreErrorKind};
    use crate::coordinator;
    use async_trait::async_trait;
    use data_types::{AppendRequest, Change, FieldType, PullRequest, Schema};
    use hlc::Hlc;
    use serde_json::{json, Value};
    use std::{collections::BTreeMap, sync::Arc};

    /// Adapter to make a concrete change-store implementation work w/
    /// [`perform_generic_tests`].
    #[async_trait]
    pub trait TestAdapter: Send + Sync {
        /// The store type under test.
        type Store: ChangeStore + StateReader;

        /// Create a fresh, empty store without a materializer.
        async fn new_store(&self) -> Arc<Self::Store>;

        /// Create a fresh, empty store materializing into `schema`.
        async fn new_materializing_store(&self, schema: Schema) -> Arc<Self::Store>;
    }

    /// The schema the generic tests materialize into.
    pub fn test_schema() -> Schema {
        Schema::builder()
            .entity("todos")
            .field("title", FieldType::String)
            .field("done", FieldType::Boolean)
            .optional_field("priority", FieldType::Number)
            .build()
            .expect("valid test schema")
    }

    /// Parse an HLC literal.
    pub fn hlc(text: &str) -> Hlc {
        text.parse().expect("valid hlc literal")
    }

    /// Build an upsert against the `todos` entity.
    pub fn upsert(stream: &str, id: &str, fields: &[(&str, Value)], at: &str) -> Change {
        Change::upsert(
            stream,
            "todos",
            id,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            hlc(at),
        )
    }

    /// Build a delete against the `todos` entity.
    pub fn delete(stream: &str, id: &str, at: &str) -> Change {
        Change::delete(stream, "todos", id, hlc(at))
    }

    fn append_request(stream: &str, changes: Vec<Change>) -> AppendRequest {
        AppendRequest {
            stream: stream.into(),
            changes,
            idempotency_key: None,
        }
    }

    fn pull_request(stream: &str, cursor: Option<&str>, limit: Option<u32>) -> PullRequest {
        PullRequest {
            stream: stream.into(),
            cursor: cursor.map(Into::into),
            limit,
        }
    }

    /// Generic test suite that must be passed by all proper change-store
    /// implementations.
    ///
    /// See [`TestAdapter`] for how to make a concrete implementation work
    /// with this test suite.
    ///
    /// Note that you might need more tests on top of this to assert specific
    /// implementation behaviors, edge cases, and error handling.
    pub async fn perform_generic_tests<T>(adapter: T)
    where
        T: TestAdapter,
    {
        test_basic_append_pull(&adapter).await;
        test_batch_append_preserves_order(&adapter).await;
        test_empty_append(&adapter).await;
        test_idempotent_append(&adapter).await;
        test_idempotency_keys_scoped_per_stream(&adapter).await;
        test_pagination(&adapter).await;
        test_cursor_tolerates_junk(&adapter).await;
        test_streams_are_isolated(&adapter).await;
        test_last_writer_wins_per_field(&adapter).await;
        test_tombstone_precedence(&adapter).await;
        test_replicas_converge(&adapter).await;
        test_atomic_rollback(&adapter).await;
    }

    async fn test_basic_append_pull<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_materializing_store(test_schema()).await;

        let change = upsert(
            "user-1",
            "t1",
            &[
                ("id", json!("t1")),
                ("title", json!("Buy milk")),
                ("done", json!(false)),
            ],
            "100:0:n1",
        );

        let result = coordinator::append(&*store, append_request("user-1", vec![change.clone()]))
            .await
            .unwrap();
        assert_eq!(result.accepted, 1);

        let response = coordinator::pull(&*store, pull_request("user-1", None, None))
            .await
            .unwrap();
        assert_eq!(response.changes, vec![change]);
        assert_eq!(response.next_cursor.as_deref(), Some("1"));

        let state = store.get("todos", "t1").await.unwrap().expect("state");
        assert_eq!(state.values["title"], json!("Buy milk"));
        assert_eq!(state.values["done"], json!(false));
        assert_eq!(state.tags["title"], hlc("100:0:n1"));
        assert!(!state.deleted);
    }

    async fn test_batch_append_preserves_order<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let changes: Vec<_> = (0..4)
            .map(|i| {
                upsert(
                    "user-1",
                    &format!("t{i}"),
                    &[("title", json!(format!("task {i}")))],
                    &format!("{}:0:n1", 100 + i),
                )
            })
            .collect();

        let result = coordinator::append(&*store, append_request("user-1", changes.clone()))
            .await
            .unwrap();
        assert_eq!(result.accepted, 4);

        let response = coordinator::pull(&*store, pull_request("user-1", None, None))
            .await
            .unwrap();
        assert_eq!(response.changes, changes);
        assert_eq!(response.next_cursor.as_deref(), Some("4"));
    }

    async fn test_empty_append<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let result = coordinator::append(&*store, append_request("user-1", vec![]))
            .await
            .unwrap();
        assert_eq!(result.accepted, 0);

        let response = coordinator::pull(&*store, pull_request("user-1", None, None))
            .await
            .unwrap();
        assert!(response.changes.is_empty());
        assert_eq!(response.next_cursor, None);
    }

    async fn test_idempotent_append<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let change = upsert("user-1", "t1", &[("title", json!("once"))], "100:0:n1");
        let request = AppendRequest {
            stream: "user-1".into(),
            changes: vec![change],
            idempotency_key: Some("k1".into()),
        };

        let first = coordinator::append(&*store, request.clone()).await.unwrap();
        assert_eq!(first.accepted, 1);

        let second = coordinator::append(&*store, request).await.unwrap();
        assert_eq!(second.accepted, 0);

        let response = coordinator::pull(&*store, pull_request("user-1", None, None))
            .await
            .unwrap();
        assert_eq!(response.changes.len(), 1);
        assert_eq!(response.next_cursor.as_deref(), Some("1"));
    }

    async fn test_idempotency_keys_scoped_per_stream<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        for stream in ["user-1", "user-2"] {
            let request = AppendRequest {
                stream: stream.into(),
                changes: vec![upsert(stream, "t1", &[("title", json!("x"))], "100:0:n1")],
                idempotency_key: Some("shared-key".into()),
            };
            let result = coordinator::append(&*store, request).await.unwrap();
            assert_eq!(result.accepted, 1, "stream {stream} must accept the key");
        }
    }

    async fn test_pagination<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let changes: Vec<_> = (0..5)
            .map(|i| {
                upsert(
                    "user-1",
                    &format!("t{i}"),
                    &[("title", json!(format!("task {i}")))],
                    &format!("{}:0:n1", 100 + i),
                )
            })
            .collect();
        coordinator::append(&*store, append_request("user-1", changes))
            .await
            .unwrap();

        let page = coordinator::pull(&*store, pull_request("user-1", None, Some(2)))
            .await
            .unwrap();
        let ids: Vec<_> = page.changes.iter().map(|c| c.entity_id.clone()).collect();
        assert_eq!(ids, vec!["t0", "t1"]);
        assert_eq!(page.next_cursor.as_deref(), Some("2"));

        let page = coordinator::pull(&*store, pull_request("user-1", Some("2"), Some(2)))
            .await
            .unwrap();
        let ids: Vec<_> = page.changes.iter().map(|c| c.entity_id.clone()).collect();
        assert_eq!(ids, vec!["t2", "t3"]);
        assert_eq!(page.next_cursor.as_deref(), Some("4"));

        let page = coordinator::pull(&*store, pull_request("user-1", Some("4"), Some(2)))
            .await
            .unwrap();
        let ids: Vec<_> = page.changes.iter().map(|c| c.entity_id.clone()).collect();
        assert_eq!(ids, vec!["t4"]);
        assert_eq!(page.next_cursor.as_deref(), Some("5"));

        // a drained stream keeps handing back the same cursor
        let page = coordinator::pull(&*store, pull_request("user-1", Some("5"), Some(2)))
            .await
            .unwrap();
        assert!(page.changes.is_empty());
        assert_eq!(page.next_cursor.as_deref(), Some("5"));
    }

    async fn test_cursor_tolerates_junk<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        let changes = vec![
            upsert("user-1", "t1", &[("title", json!("a"))], "100:0:n1"),
            upsert("user-1", "t2", &[("title", json!("b"))], "101:0:n1"),
        ];
        coordinator::append(&*store, append_request("user-1", changes))
            .await
            .unwrap();

        for junk in ["garbage", "-3", ""] {
            let page = coordinator::pull(&*store, pull_request("user-1", Some(junk), None))
                .await
                .unwrap();
            assert_eq!(page.changes.len(), 2, "cursor {junk:?} must read from the start");
        }

        // fractional cursors floor
        let page = coordinator::pull(&*store, pull_request("user-1", Some("1.7"), None))
            .await
            .unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.changes[0].entity_id, "t2");
    }

    async fn test_streams_are_isolated<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_store().await;

        coordinator::append(
            &*store,
            append_request(
                "user-1",
                vec![upsert("user-1", "a1", &[("title", json!("a1"))], "100:0:n1")],
            ),
        )
        .await
        .unwrap();
        coordinator::append(
            &*store,
            append_request(
                "user-2",
                vec![upsert("user-2", "b1", &[("title", json!("b1"))], "100:0:n2")],
            ),
        )
        .await
        .unwrap();
        coordinator::append(
            &*store,
            append_request(
                "user-1",
                vec![upsert("user-1", "a2", &[("title", json!("a2"))], "101:0:n1")],
            ),
        )
        .await
        .unwrap();

        let page = coordinator::pull(&*store, pull_request("user-1", None, None))
            .await
            .unwrap();
        let ids: Vec<_> = page.changes.iter().map(|c| c.entity_id.clone()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert_eq!(page.next_cursor.as_deref(), Some("3"));

        let page = coordinator::pull(&*store, pull_request("user-2", None, None))
            .await
            .unwrap();
        let ids: Vec<_> = page.changes.iter().map(|c| c.entity_id.clone()).collect();
        assert_eq!(ids, vec!["b1"]);
        assert_eq!(page.next_cursor.as_deref(), Some("2"));
    }

    async fn test_last_writer_wins_per_field<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_materializing_store(test_schema()).await;

        coordinator::append(
            &*store,
            append_request(
                "user-1",
                vec![upsert(
                    "user-1",
                    "t1",
                    &[("title", json!("A")), ("done", json!(false))],
                    "100:0:n1",
                )],
            ),
        )
        .await
        .unwrap();
        coordinator::append(
            &*store,
            append_request(
                "user-1",
                vec![upsert("user-1", "t1", &[("done", json!(true))], "101:0:n1")],
            ),
        )
        .await
        .unwrap();

        let state = store.get("todos", "t1").await.unwrap().expect("state");
        assert_eq!(state.values["title"], json!("A"));
        assert_eq!(state.values["done"], json!(true));
        assert_eq!(state.tags["title"], hlc("100:0:n1"));
        assert_eq!(state.tags["done"], hlc("101:0:n1"));
    }

    async fn test_tombstone_precedence<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_materializing_store(test_schema()).await;
        let one = |change: Change| append_request("user-1", vec![change]);

        coordinator::append(
            &*store,
            one(upsert(
                "user-1",
                "t1",
                &[("title", json!("A")), ("done", json!(false))],
                "100:0:n1",
            )),
        )
        .await
        .unwrap();

        // an older delete is swallowed
        coordinator::append(&*store, one(delete("user-1", "t1", "99:0:n2")))
            .await
            .unwrap();
        assert!(store.get("todos", "t1").await.unwrap().is_some());

        // a newer delete tombstones
        coordinator::append(&*store, one(delete("user-1", "t1", "101:0:n2")))
            .await
            .unwrap();
        assert!(store.get("todos", "t1").await.unwrap().is_none());

        // an upsert below the tombstone stays swallowed
        coordinator::append(
            &*store,
            one(upsert("user-1", "t1", &[("title", json!("B"))], "100:5:n3")),
        )
        .await
        .unwrap();
        assert!(store.get("todos", "t1").await.unwrap().is_none());

        // an upsert above the tombstone revives the entity
        coordinator::append(
            &*store,
            one(upsert("user-1", "t1", &[("title", json!("C"))], "102:0:n3")),
        )
        .await
        .unwrap();
        let state = store.get("todos", "t1").await.unwrap().expect("revived");
        assert_eq!(state.values["title"], json!("C"));
        assert_eq!(state.deleted_tag, Some(hlc("101:0:n2")));
    }

    async fn test_replicas_converge<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let a = adapter.new_materializing_store(test_schema()).await;
        let b = adapter.new_materializing_store(test_schema()).await;

        let c1 = upsert(
            "user-1",
            "t1",
            &[("title", json!("A")), ("done", json!(false))],
            "100:0:n1",
        );
        let c2 = upsert("user-1", "t1", &[("done", json!(true))], "101:0:n1");
        let c3 = upsert("user-1", "t1", &[("title", json!("B"))], "100:0:n2");
        let c4 = delete("user-1", "t2", "200:0:n3");
        let c5 = upsert("user-1", "t2", &[("title", json!("gone"))], "150:0:n1");

        for change in [&c1, &c2, &c3, &c4, &c5] {
            coordinator::append(&*a, append_request("user-1", vec![change.clone()]))
                .await
                .unwrap();
        }
        for change in [&c5, &c4, &c3, &c2, &c1] {
            coordinator::append(&*b, append_request("user-1", vec![change.clone()]))
                .await
                .unwrap();
        }

        let state_a = a.get("todos", "t1").await.unwrap().expect("state");
        let state_b = b.get("todos", "t1").await.unwrap().expect("state");
        assert_eq!(state_a, state_b);
        assert_eq!(state_a.values["title"], json!("B"));
        assert_eq!(state_a.values["done"], json!(true));

        // the delete is newest for t2, so both replicas end tombstoned
        assert!(a.get("todos", "t2").await.unwrap().is_none());
        assert!(b.get("todos", "t2").await.unwrap().is_none());
    }

    async fn test_atomic_rollback<T>(adapter: &T)
    where
        T: TestAdapter,
    {
        let store = adapter.new_materializing_store(test_schema()).await;

        coordinator::append(
            &*store,
            append_request(
                "user-1",
                vec![upsert("user-1", "t1", &[("title", json!("keep"))], "100:0:n1")],
            ),
        )
        .await
        .unwrap();

        // the second change materializes into an entity the schema does not
        // know, failing the transaction after the log inserts
        let good = upsert("user-1", "t2", &[("title", json!("lost"))], "101:0:n1");
        let bad = Change::upsert(
            "user-1",
            "ghosts",
            "g1",
            [("name".to_string(), json!("boo"))].into_iter().collect(),
            hlc("102:0:n1"),
        );
        let request = AppendRequest {
            stream: "user-1".into(),
            changes: vec![good.clone(), bad],
            idempotency_key: Some("k-rollback".into()),
        };

        let err = coordinator::append(&*store, request).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::TransactionAborted);

        // no partial effects: the log, the materialized state and the
        // idempotency record all read as before the call
        let page = coordinator::pull(&*store, pull_request("user-1", None, None))
            .await
            .unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("1"));
        assert!(store.get("todos", "t2").await.unwrap().is_none());

        // the failed attempt did not burn the idempotency key
        let retry = AppendRequest {
            stream: "user-1".into(),
            changes: vec![good],
            idempotency_key: Some("k-rollback".into()),
        };
        let result = coordinator::append(&*store, retry).await.unwrap();
        assert_eq!(result.accepted, 1);
        assert!(store.get("todos", "t2").await.unwrap().is_some());
    }
}
