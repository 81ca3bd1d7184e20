//! Kernel for local-first, eventually-consistent data replication.
//!
//! Every mutation is a [`Change`] (an upsert or delete of one entity
//! instance) stamped with a hybrid logical clock. Changes land in an
//! append-only per-stream log and fold into materialized per-entity state,
//! last-writer-wins per field, inside a single transaction. Consumers resume
//! reads with opaque cursors and replicas converge no matter the order
//! changes arrive in.
//!
//! The pieces:
//!
//! - [`Hlc`] / [`HlcClock`]: timestamp algebra (`tick`, `observe`) giving a
//!   total order that tracks causality while staying near wall-clock time.
//! - [`Change`] and [`merge`]: the mutation model and the pure merge core.
//! - [`append`] / [`pull`]: the transactional write path and the
//!   cursor-paginated read path over any [`ChangeStore`].
//! - [`MemStore`] and [`SqliteStore`]: the reference backends, both also
//!   serving live state through [`StateReader`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use ripple::time::SystemProvider;
//! use ripple::{
//!     AppendRequest, Change, FieldType, HlcClock, MemStore, NodeId, PullRequest, Schema,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = Schema::builder()
//!     .entity("todos")
//!     .field("title", FieldType::String)
//!     .field("done", FieldType::Boolean)
//!     .build()?;
//! let store = MemStore::with_schema(schema);
//! let mut clock = HlcClock::new(NodeId::new("client-1")?, Arc::new(SystemProvider::new()));
//!
//! let change = Change::upsert(
//!     "user-1",
//!     "todos",
//!     "t1",
//!     [("title".to_string(), serde_json::json!("Buy milk"))]
//!         .into_iter()
//!         .collect(),
//!     clock.tick(),
//! );
//! ripple::append(
//!     &store,
//!     AppendRequest {
//!         stream: "user-1".into(),
//!         changes: vec![change],
//!         idempotency_key: Some("first-write".into()),
//!     },
//! )
//! .await?;
//!
//! let page = ripple::pull(
//!     &store,
//!     PullRequest {
//!         stream: "user-1".into(),
//!         cursor: None,
//!         limit: None,
//!     },
//! )
//! .await?;
//! assert_eq!(page.changes.len(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub use change_log::coordinator::{append, pull, DEFAULT_PULL_LIMIT};
pub use change_log::core::{
    ChangeStore, IdempotencyRepo, LogRepo, Materializer, StateReader, StoreError, StoreErrorKind,
    StoreTransaction,
};
pub use change_log::mem::MemStore;
pub use change_log::sqlite::SqliteStore;
pub use change_log::{codec, cursor};
pub use data_types::{
    AppendRequest, AppendResult, Change, ChangeError, ChangeKind, EntitySchema, Field, FieldType,
    LogEntry, PullRequest, PullResponse, Schema, SchemaBuilder, SchemaError, SequenceNumber,
};
pub use hlc::{Hlc, HlcClock, NodeId};
pub use lww::{merge, EntityState, MergeOutcome};
pub use ripple_time as time;
