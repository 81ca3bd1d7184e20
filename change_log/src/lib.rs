//! The replication kernel's storage layer: an append-only per-stream change
//! log with cursor-paginated pulls, an idempotency table, and a materializer
//! keeping per-entity derived state, all bound into single transactions by
//! the coordinator.
//!
//! Backends implement the traits in [`core`]; [`mem`] and [`sqlite`] are the
//! reference implementations. [`coordinator::append`] and
//! [`coordinator::pull`] are the operations callers drive.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod codec;
pub mod coordinator;
pub mod core;
pub mod cursor;
pub mod mem;
pub mod sqlite;
