//! SQLite implementation of the change store, on top of `sqlx`.
//!
//! The kernel tables are `ripple_log` (append-only, `seq` assigned by
//! AUTOINCREMENT), `ripple_idempotency` (composite primary key enforcing
//! at-most-once appends) and `ripple_tags` (authoritative merge metadata).
//! When a schema descriptor is supplied, one domain table per entity is
//! created and kept as a projection of the latest accepted values, with
//! booleans stored as integers and enums as text.
//!
//! The connection pool is capped at a single connection so appends are
//! totally ordered per store; tombstoned entities have their domain row
//! deleted while the tags row keeps the tombstone.

use crate::codec;
use crate::core::{
    ChangeStore, IdempotencyRepo, LogRepo, Materializer, StateReader, StoreError, StoreTransaction,
};
use async_trait::async_trait;
use data_types::{Change, EntitySchema, Field, FieldType, LogEntry, Schema, SequenceNumber};
use lww::EntityState;
use observability_deps::tracing::debug;
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, Transaction,
};
use std::collections::BTreeMap;
use std::str::FromStr;

const CREATE_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ripple_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    stream TEXT NOT NULL,
    change TEXT NOT NULL
)
"#;

const CREATE_LOG_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS ripple_log_stream_seq ON ripple_log (stream, seq)
"#;

const CREATE_IDEMPOTENCY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ripple_idempotency (
    stream TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    last_seq INTEGER NOT NULL,
    PRIMARY KEY (stream, idempotency_key)
)
"#;

const CREATE_TAGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ripple_tags (
    entity TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    tags TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    deleted_tag TEXT,
    PRIMARY KEY (entity, id)
)
"#;

const UPSERT_TAGS_ROW: &str = r#"
INSERT INTO ripple_tags (entity, id, data, tags, deleted, deleted_tag)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT (entity, id) DO UPDATE SET
    data = excluded.data,
    tags = excluded.tags,
    deleted = excluded.deleted,
    deleted_tag = excluded.deleted_tag
"#;

const SELECT_TAGS_ROW: &str = r#"
SELECT data, tags, deleted, deleted_tag FROM ripple_tags WHERE entity = ? AND id = ?
"#;

/// A durable [`ChangeStore`] backed by SQLite.
#[derive(Debug)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    schema: Option<Schema>,
}

impl SqliteStore {
    /// Connect to `dsn` (e.g. `sqlite:///path/to/replica.db`), creating the
    /// database and the kernel tables as needed. When `schema` is given the
    /// store materializes into it and one domain table per entity is
    /// created.
    pub async fn connect(dsn: &str, schema: Option<Schema>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(dsn)?.create_if_missing(true);

        // one connection keeps appends totally ordered per store
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool, schema };
        store.setup().await?;
        debug!(dsn = dsn, "sqlite store ready");
        Ok(store)
    }

    async fn setup(&self) -> Result<(), StoreError> {
        for ddl in [
            CREATE_LOG_TABLE,
            CREATE_LOG_INDEX,
            CREATE_IDEMPOTENCY_TABLE,
            CREATE_TAGS_TABLE,
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        if let Some(schema) = &self.schema {
            for entity in schema.entities() {
                sqlx::query(&domain_table_ddl(entity))
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let inner = self.pool.begin().await?;
        Ok(Box::new(SqliteTxn {
            inner: Some(inner),
            schema: self.schema.clone(),
        }))
    }

    fn type_name(&self) -> &'static str {
        "sqlite"
    }
}

#[async_trait]
impl StateReader for SqliteStore {
    async fn get(&self, entity: &str, id: &str) -> Result<Option<EntityState>, StoreError> {
        let row = sqlx::query(SELECT_TAGS_ROW)
            .bind(entity.to_string())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|row| state_from_row(&row))
            .transpose()?
            .filter(|state| !state.deleted))
    }

    async fn get_many(
        &self,
        entity: &str,
        ids: &[&str],
    ) -> Result<Vec<(String, EntityState)>, StoreError> {
        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(state) = self.get(entity, id).await? {
                states.push((id.to_string(), state));
            }
        }
        Ok(states)
    }

    async fn list(&self, entity: &str) -> Result<Vec<(String, EntityState)>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, data, tags, deleted, deleted_tag FROM ripple_tags \
             WHERE entity = ? AND deleted = 0 ORDER BY id",
        )
        .bind(entity.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                Ok((id, state_from_row(row)?))
            })
            .collect()
    }
}

/// A transaction over a [`SqliteStore`].
struct SqliteTxn {
    inner: Option<Transaction<'static, Sqlite>>,
    schema: Option<Schema>,
}

impl std::fmt::Debug for SqliteTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTxn")
            .field("open", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}

impl SqliteTxn {
    fn txn(&mut self) -> Result<&mut Transaction<'static, Sqlite>, StoreError> {
        self.inner
            .as_mut()
            .ok_or_else(|| StoreError::unknown("transaction already finalized"))
    }

    fn entity_schema(&self, entity: &str) -> Result<EntitySchema, StoreError> {
        self.schema
            .as_ref()
            .and_then(|schema| schema.entity(entity))
            .cloned()
            .ok_or_else(|| StoreError::unknown_entity(entity))
    }

    async fn upsert_tags_row(
        &mut self,
        entity: &str,
        id: &str,
        state: &EntityState,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(&state.values).map_err(StoreError::materialize_failed)?;
        let tags = serde_json::to_string(&state.tags).map_err(StoreError::materialize_failed)?;
        let deleted_tag = state.deleted_tag.as_ref().map(|tag| tag.to_string());

        sqlx::query(UPSERT_TAGS_ROW)
            .bind(entity.to_string())
            .bind(id.to_string())
            .bind(data)
            .bind(tags)
            .bind(state.deleted as i64)
            .bind(deleted_tag)
            .execute(&mut **self.txn()?)
            .await
            .map_err(StoreError::materialize_failed)?;
        Ok(())
    }

    async fn upsert_domain_row(
        &mut self,
        entity_schema: &EntitySchema,
        id: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        // the primary key column serves the id; fields the schema does not
        // map keep their previous column value by simply not being set
        let fields: Vec<Field> = entity_schema
            .fields()
            .filter(|field| field.name() != "id" && values.contains_key(field.name()))
            .cloned()
            .collect();

        let mut columns = String::from("id");
        let mut placeholders = String::from("?");
        let mut updates = String::from("id = excluded.id");
        for field in &fields {
            columns.push_str(&format!(", \"{}\"", field.name()));
            placeholders.push_str(", ?");
            updates.push_str(&format!(", \"{0}\" = excluded.\"{0}\"", field.name()));
        }
        let sql = format!(
            "INSERT INTO \"{}\" ({columns}) VALUES ({placeholders}) \
             ON CONFLICT (id) DO UPDATE SET {updates}",
            entity_schema.name(),
        );

        let mut query = sqlx::query(&sql).bind(id.to_string());
        for field in &fields {
            query = bind_field(query, field, &values[field.name()])?;
        }
        query
            .execute(&mut **self.txn()?)
            .await
            .map_err(StoreError::materialize_failed)?;
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for SqliteTxn {
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

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        match self.inner.take() {
            Some(txn) => Ok(txn.commit().await?),
            None => Ok(()),
        }
    }

    async fn abort(mut self: Box<Self>) -> Result<(), StoreError> {
        match self.inner.take() {
            Some(txn) => Ok(txn.rollback().await?),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LogRepo for SqliteTxn {
    async fn append(
        &mut self,
        stream: &str,
        change: &Change,
    ) -> Result<SequenceNumber, StoreError> {
        let blob = codec::encode_change(change)?;
        let result = sqlx::query("INSERT INTO ripple_log (stream, change) VALUES (?, ?)")
            .bind(stream.to_string())
            .bind(blob)
            .execute(&mut **self.txn()?)
            .await
            .map_err(StoreError::append_failed)?;
        Ok(SequenceNumber::new(result.last_insert_rowid()))
    }

    async fn pull(
        &mut self,
        stream: &str,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, stream, change FROM ripple_log \
             WHERE stream = ? AND seq > ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(stream.to_string())
        .bind(after.get())
        .bind(limit as i64)
        .fetch_all(&mut **self.txn()?)
        .await
        .map_err(StoreError::pull_failed)?;

        rows.iter()
            .map(|row| {
                let seq: i64 = row.try_get("seq").map_err(StoreError::pull_failed)?;
                let stream: String = row.try_get("stream").map_err(StoreError::pull_failed)?;
                let blob: String = row.try_get("change").map_err(StoreError::pull_failed)?;
                Ok(LogEntry {
                    seq: SequenceNumber::new(seq),
                    stream,
                    change: codec::decode_change(&blob)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl IdempotencyRepo for SqliteTxn {
    async fn last_seq(
        &mut self,
        stream: &str,
        key: &str,
    ) -> Result<Option<SequenceNumber>, StoreError> {
        let row = sqlx::query(
            "SELECT last_seq FROM ripple_idempotency WHERE stream = ? AND idempotency_key = ?",
        )
        .bind(stream.to_string())
        .bind(key.to_string())
        .fetch_optional(&mut **self.txn()?)
        .await
        .map_err(StoreError::append_failed)?;

        row.map(|row| {
            let seq: i64 = row.try_get("last_seq").map_err(StoreError::append_failed)?;
            Ok(SequenceNumber::new(seq))
        })
        .transpose()
    }

    async fn create(&mut self, stream: &str, key: &str) -> Result<(), StoreError> {
        // the composite primary key is the uniqueness guard; a concurrent
        // duplicate fails here and aborts the surrounding transaction
        sqlx::query(
            "INSERT INTO ripple_idempotency (stream, idempotency_key, last_seq) VALUES (?, ?, 0)",
        )
        .bind(stream.to_string())
        .bind(key.to_string())
        .execute(&mut **self.txn()?)
        .await
        .map_err(StoreError::append_failed)?;
        Ok(())
    }

    async fn set_last_seq(
        &mut self,
        stream: &str,
        key: &str,
        seq: SequenceNumber,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE ripple_idempotency SET last_seq = ? WHERE stream = ? AND idempotency_key = ?",
        )
        .bind(seq.get())
        .bind(stream.to_string())
        .bind(key.to_string())
        .execute(&mut **self.txn()?)
        .await
        .map_err(StoreError::append_failed)?;
        Ok(())
    }
}

#[async_trait]
impl Materializer for SqliteTxn {
    async fn load(&mut self, entity: &str, id: &str) -> Result<Option<EntityState>, StoreError> {
        let row = sqlx::query(SELECT_TAGS_ROW)
            .bind(entity.to_string())
            .bind(id.to_string())
            .fetch_optional(&mut **self.txn()?)
            .await
            .map_err(StoreError::materialize_failed)?;

        row.map(|row| state_from_row(&row)).transpose()
    }

    async fn save(
        &mut self,
        entity: &str,
        id: &str,
        state: &EntityState,
    ) -> Result<(), StoreError> {
        let entity_schema = self.entity_schema(entity)?;
        self.upsert_tags_row(entity, id, state).await?;
        self.upsert_domain_row(&entity_schema, id, &state.values)
            .await
    }

    async fn remove(
        &mut self,
        entity: &str,
        id: &str,
        state: &EntityState,
    ) -> Result<(), StoreError> {
        let entity_schema = self.entity_schema(entity)?;
        self.upsert_tags_row(entity, id, state).await?;

        // this backend drops the domain row for tombstoned entities
        let sql = format!("DELETE FROM \"{}\" WHERE id = ?", entity_schema.name());
        sqlx::query(&sql)
            .bind(id.to_string())
            .execute(&mut **self.txn()?)
            .await
            .map_err(StoreError::materialize_failed)?;
        Ok(())
    }

    async fn save_entity(
        &mut self,
        entity: &str,
        id: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        let entity_schema = self.entity_schema(entity)?;
        self.upsert_domain_row(&entity_schema, id, values).await
    }
}

fn domain_table_ddl(entity: &EntitySchema) -> String {
    let mut columns = vec!["id TEXT PRIMARY KEY".to_string()];
    for field in entity.fields() {
        if field.name() == "id" {
            continue;
        }
        columns.push(format!(
            "\"{}\" {}",
            field.name(),
            column_type(field.field_type())
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        entity.name(),
        columns.join(", ")
    )
}

fn column_type(field_type: &FieldType) -> &'static str {
    match field_type {
        FieldType::String | FieldType::Enum(_) => "TEXT",
        FieldType::Number => "DOUBLE",
        FieldType::Boolean => "INTEGER",
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_field<'q>(
    query: SqliteQuery<'q>,
    field: &Field,
    value: &Value,
) -> Result<SqliteQuery<'q>, StoreError> {
    let query = match (field.field_type(), value) {
        (_, Value::Null) => query.bind(None::<String>),
        (FieldType::String, Value::String(text)) | (FieldType::Enum(_), Value::String(text)) => {
            query.bind(text.clone())
        }
        (FieldType::Number, Value::Number(number)) => match number.as_f64() {
            Some(number) => query.bind(number),
            None => {
                return Err(StoreError::materialize_failed(format!(
                    "field {:?} holds a number outside the double range",
                    field.name(),
                )))
            }
        },
        // stores without a native boolean get 0/1
        (FieldType::Boolean, Value::Bool(flag)) => query.bind(*flag as i64),
        (field_type, value) => {
            return Err(StoreError::materialize_failed(format!(
                "field {:?} expects {field_type:?} but the patch holds {value}",
                field.name(),
            )))
        }
    };
    Ok(query)
}

fn state_from_row(row: &SqliteRow) -> Result<EntityState, StoreError> {
    let data: String = row.try_get("data").map_err(StoreError::materialize_failed)?;
    let tags: String = row.try_get("tags").map_err(StoreError::materialize_failed)?;
    let deleted: i64 = row
        .try_get("deleted")
        .map_err(StoreError::materialize_failed)?;
    let deleted_tag: Option<String> = row
        .try_get("deleted_tag")
        .map_err(StoreError::materialize_failed)?;

    Ok(EntityState {
        values: serde_json::from_str(&data).map_err(StoreError::materialize_failed)?,
        tags: serde_json::from_str(&tags).map_err(StoreError::materialize_failed)?,
        deleted: deleted != 0,
        deleted_tag: deleted_tag
            .map(|tag| tag.parse())
            .transpose()
            .map_err(StoreError::materialize_failed)?,
    })
}
