//! Shared data types for the replication kernel: log sequence numbers, the
//! schema descriptor, the [`Change`] model, and the append/pull request and
//! response shapes.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use hlc::Hlc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ensure, Snafu};
use std::{collections::BTreeMap, ops::Add};

/// Entity tables managed by the kernel itself use this prefix; schema entities
/// may not claim it.
pub const RESERVED_TABLE_PREFIX: &str = "ripple_";

/// A sequence number assigned by the change log at append time.
///
/// Sequence numbers start at 1 and increase monotonically per store; they are
/// the stable anchor for pull cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(i64);

#[allow(missing_docs)]
impl SequenceNumber {
    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Add<i64> for SequenceNumber {
    type Output = Self;

    fn add(self, other: i64) -> Self {
        Self(self.0 + other)
    }
}

/// A committed change-log row: the change together with its assigned
/// sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Position in the log; unique per store.
    pub seq: SequenceNumber,
    /// The stream the change was appended to.
    pub stream: String,
    /// The decoded change payload.
    pub change: Change,
}

/// Errors building a [`Schema`].
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum SchemaError {
    #[snafu(display(
        "invalid identifier {name:?}: identifiers start with a letter or underscore followed by letters, digits or underscores"
    ))]
    InvalidIdentifier { name: String },

    #[snafu(display("entity name {name:?} collides with the reserved \"ripple_\" table prefix"))]
    ReservedEntityName { name: String },

    #[snafu(display("duplicate entity {name:?}"))]
    DuplicateEntity { name: String },

    #[snafu(display("duplicate field {field:?} on entity {entity:?}"))]
    DuplicateField { entity: String, field: String },

    #[snafu(display("enum field {field:?} on entity {entity:?} has no values"))]
    EmptyEnum { entity: String, field: String },

    #[snafu(display("field {field:?} declared before any entity"))]
    FieldWithoutEntity { field: String },
}

/// The value type of a schema field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// UTF-8 text.
    String,
    /// A double-precision float.
    Number,
    /// A boolean; stores without a native boolean persist it as an integer.
    Boolean,
    /// One of a fixed set of textual values; persisted as text.
    Enum(Vec<String>),
}

/// A single field descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    field_type: FieldType,
    optional: bool,
}

impl Field {
    /// The field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared value type.
    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    /// Whether the field may be absent.
    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// An entity descriptor: a name plus its ordered fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    name: String,
    fields: Vec<Field>,
}

impl EntitySchema {
    /// The entity name, used as the domain table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// Look a field up by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// The schema descriptor: an ordered set of entities with ordered fields.
///
/// The descriptor carries no runtime values. The merge core does not need it;
/// backends use it to shape domain tables and coerce values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    entities: Vec<EntitySchema>,
}

impl Schema {
    /// Start building a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// The entities in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.iter()
    }

    /// Look an entity up by name.
    pub fn entity(&self, name: &str) -> Option<&EntitySchema> {
        self.entities.iter().find(|e| e.name == name)
    }
}

/// Builder for [`Schema`]; validation happens in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: Vec<EntitySchema>,
    orphan_field: Option<String>,
}

impl SchemaBuilder {
    /// Begin a new entity; subsequent `field` calls attach to it.
    pub fn entity(mut self, name: impl Into<String>) -> Self {
        self.entities.push(EntitySchema {
            name: name.into(),
            fields: vec![],
        });
        self
    }

    /// Add a required field to the current entity.
    pub fn field(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.push_field(name.into(), field_type, false)
    }

    /// Add an optional field to the current entity.
    pub fn optional_field(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.push_field(name.into(), field_type, true)
    }

    fn push_field(mut self, name: String, field_type: FieldType, optional: bool) -> Self {
        match self.entities.last_mut() {
            Some(entity) => entity.fields.push(Field {
                name,
                field_type,
                optional,
            }),
            None => {
                self.orphan_field.get_or_insert(name);
            }
        }
        self
    }

    /// Validate and produce the schema.
    pub fn build(self) -> Result<Schema, SchemaError> {
        if let Some(field) = self.orphan_field {
            return FieldWithoutEntitySnafu { field }.fail();
        }

        let mut seen_entities = std::collections::BTreeSet::new();
        for entity in &self.entities {
            ensure!(
                is_identifier(&entity.name),
                InvalidIdentifierSnafu { name: &entity.name }
            );
            ensure!(
                !entity.name.starts_with(RESERVED_TABLE_PREFIX),
                ReservedEntityNameSnafu { name: &entity.name }
            );
            ensure!(
                seen_entities.insert(entity.name.clone()),
                DuplicateEntitySnafu { name: &entity.name }
            );

            let mut seen_fields = std::collections::BTreeSet::new();
            for field in &entity.fields {
                ensure!(
                    is_identifier(&field.name),
                    InvalidIdentifierSnafu { name: &field.name }
                );
                ensure!(
                    seen_fields.insert(field.name.clone()),
                    DuplicateFieldSnafu {
                        entity: &entity.name,
                        field: &field.name,
                    }
                );
                if let FieldType::Enum(values) = &field.field_type {
                    ensure!(
                        !values.is_empty(),
                        EmptyEnumSnafu {
                            entity: &entity.name,
                            field: &field.name,
                        }
                    );
                }
            }
        }

        Ok(Schema {
            entities: self.entities,
        })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Errors raised by [`Change::validate`].
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ChangeError {
    #[snafu(display(
        "invalid upsert for {entity}/{entity_id}: patch and tags must cover the same fields"
    ))]
    TagKeyMismatch { entity: String, entity_id: String },

    #[snafu(display(
        "invalid upsert for {entity}/{entity_id}: tag for field {field:?} predates the change timestamp"
    ))]
    TagPredatesChange {
        entity: String,
        entity_id: String,
        field: String,
    },

    #[snafu(display("invalid delete for {entity}/{entity_id}: patch and tags must be empty"))]
    DeleteWithPayload { entity: String, entity_id: String },
}

/// Whether a change writes fields or tombstones the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Write the patched fields, last-writer-wins per field.
    Upsert,
    /// Tombstone the entity as of the change timestamp.
    Delete,
}

/// A single replicated mutation targeting one entity instance.
///
/// This struct doubles as the wire/storage encoding: it serializes to the
/// JSON object `{stream, entity, entityId, kind, patch, tags, hlc}` with HLC
/// values in their canonical text form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Logical log partition, e.g. one per tenant or user.
    pub stream: String,
    /// Entity (domain table) name.
    pub entity: String,
    /// Identity of the target row, unique within `(stream, entity)`.
    pub entity_id: String,
    /// Upsert or delete.
    pub kind: ChangeKind,
    /// Field values written by an upsert; empty for deletes.
    #[serde(default)]
    pub patch: BTreeMap<String, Value>,
    /// Per-field acceptance tags; same key set as `patch` for upserts.
    #[serde(default)]
    pub tags: BTreeMap<String, Hlc>,
    /// The effective time of the change; the tombstone timestamp for deletes.
    pub hlc: Hlc,
}

impl Change {
    /// Build an upsert, tagging every patched field with the change timestamp.
    pub fn upsert(
        stream: impl Into<String>,
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        patch: BTreeMap<String, Value>,
        hlc: Hlc,
    ) -> Self {
        let tags = patch.keys().map(|f| (f.clone(), hlc.clone())).collect();
        Self {
            stream: stream.into(),
            entity: entity.into(),
            entity_id: entity_id.into(),
            kind: ChangeKind::Upsert,
            patch,
            tags,
            hlc,
        }
    }

    /// Build an upsert with caller-supplied per-field tags.
    pub fn upsert_with_tags(
        stream: impl Into<String>,
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        patch: BTreeMap<String, Value>,
        tags: BTreeMap<String, Hlc>,
        hlc: Hlc,
    ) -> Self {
        Self {
            stream: stream.into(),
            entity: entity.into(),
            entity_id: entity_id.into(),
            kind: ChangeKind::Upsert,
            patch,
            tags,
            hlc,
        }
    }

    /// Build a delete carrying only the tombstone timestamp.
    pub fn delete(
        stream: impl Into<String>,
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        hlc: Hlc,
    ) -> Self {
        Self {
            stream: stream.into(),
            entity: entity.into(),
            entity_id: entity_id.into(),
            kind: ChangeKind::Delete,
            patch: BTreeMap::new(),
            tags: BTreeMap::new(),
            hlc,
        }
    }

    /// Check the structural invariants: upserts tag exactly their patched
    /// fields with tags no older than the change timestamp; deletes carry no
    /// payload.
    pub fn validate(&self) -> Result<(), ChangeError> {
        match self.kind {
            ChangeKind::Upsert => {
                ensure!(
                    self.patch.len() == self.tags.len()
                        && self.patch.keys().all(|f| self.tags.contains_key(f)),
                    TagKeyMismatchSnafu {
                        entity: &self.entity,
                        entity_id: &self.entity_id,
                    }
                );
                for (field, tag) in &self.tags {
                    ensure!(
                        *tag >= self.hlc,
                        TagPredatesChangeSnafu {
                            entity: &self.entity,
                            entity_id: &self.entity_id,
                            field,
                        }
                    );
                }
                Ok(())
            }
            ChangeKind::Delete => {
                ensure!(
                    self.patch.is_empty() && self.tags.is_empty(),
                    DeleteWithPayloadSnafu {
                        entity: &self.entity,
                        entity_id: &self.entity_id,
                    }
                );
                Ok(())
            }
        }
    }
}

/// A batch of changes to append to one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    /// Target stream.
    pub stream: String,
    /// Changes in submission order.
    pub changes: Vec<Change>,
    /// Makes the append at-most-once per `(stream, key)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// The outcome of an append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResult {
    /// How many changes were written; `0` for an idempotent replay.
    pub accepted: u32,
    /// Optionally, a server-issued write timestamp echoed by transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hlc: Option<Hlc>,
}

/// A cursor-paginated read of one stream's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Stream to read.
    pub stream: String,
    /// Resume token from a previous pull, or `None` to start from the
    /// beginning.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Maximum number of changes to return; the log applies its default when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// One page of a stream's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// The changes after the cursor, ascending by sequence number.
    pub changes: Vec<Change>,
    /// Token for the next page; unchanged from the request when this page is
    /// empty.
    pub next_cursor: Option<String>,
}
