//! Mutable documents bound to a schema.
//!
//! An [`Item`] is the unit application code reads and writes: a typed field
//! map plus the schema that governs it. Reads fall back to schema defaults,
//! writes are type-checked and leave per-field dirty marks, and the
//! diff/patch pair produces and consumes [`ChangeSet`]s whose round-trip
//! invariant (`patch(a, diff(a, b)) == b` up to canonical form) the merge
//! machinery depends on.

pub mod changeset;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::SchemaError;
use crate::hash::ContentHash;
use crate::internal::schema::Schema;
use crate::internal::value::richtext::{RichText, diff_flat};
use crate::internal::value::{Value, canonical};

pub use changeset::{ChangeSet, FieldChange, MapEntryChange, SpliceOp};

/// A document: schema + field map + deletion marker.
#[derive(Debug, Clone)]
pub struct Item {
    schema: Arc<Schema>,
    fields: BTreeMap<String, Value>,
    dirty: BTreeSet<String>,
    deleted: bool,
}

/// Schema-reference + field map form that commits and the wire carry.
/// Reconstructing an [`Item`] from a snapshot goes through the registry so
/// older versions upgrade transparently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    #[serde(rename = "ns")]
    pub namespace: String,
    #[serde(rename = "ver")]
    pub version: u32,
    #[serde(rename = "f")]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "del", default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl Item {
    /// An empty document under `schema`.
    pub fn new(schema: Arc<Schema>) -> Self {
        Item {
            schema,
            fields: BTreeMap::new(),
            dirty: BTreeSet::new(),
            deleted: false,
        }
    }

    /// The schema's canonical zero document: no stored fields, reads fall
    /// back to declared defaults.
    pub fn null_of(schema: Arc<Schema>) -> Self {
        Item::new(schema)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Swap the governing schema; used by registry upgrades.
    pub(crate) fn rebind_schema(&mut self, schema: Arc<Schema>) {
        self.schema = schema;
    }

    /// Read a field: the stored value, else the schema default. A deleted
    /// item reads as the schema null-item.
    pub fn get(&self, field: &str) -> Option<&Value> {
        if !self.deleted {
            if let Some(value) = self.fields.get(field) {
                return Some(value);
            }
        }
        self.schema
            .field_spec(field)
            .and_then(|spec| spec.default.as_ref())
    }

    /// Whether the field is explicitly present (as opposed to defaulted).
    pub fn has(&self, field: &str) -> bool {
        !self.deleted && self.fields.contains_key(field)
    }

    /// Type-checked write. Records a dirty mark for the field.
    pub fn set(&mut self, field: impl Into<String>, value: Value) -> Result<(), SchemaError> {
        let field = field.into();
        let value = value.normalized();
        self.schema.check_value(&field, &value)?;
        self.fields.insert(field.clone(), value);
        self.dirty.insert(field);
        Ok(())
    }

    /// Explicitly remove a field; reads revert to the schema default.
    pub fn clear(&mut self, field: &str) {
        if self.fields.remove(field).is_some() {
            self.dirty.insert(field.to_string());
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Mark or unmark deletion. The key survives; reads see the null-item.
    pub fn set_deleted(&mut self, deleted: bool) {
        if self.deleted != deleted {
            self.deleted = deleted;
            self.dirty.insert("@deleted".to_string());
        }
    }

    /// Fields touched since the last [`Item::take_dirty`].
    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    pub fn take_dirty(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.dirty)
    }

    /// Effective field view: stored values overlaid on schema defaults,
    /// empty when deleted. This is the canonical form's field map.
    fn effective_fields(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        if self.deleted {
            return out;
        }
        for (name, spec) in &self.schema.fields {
            if let Some(value) = self.fields.get(name) {
                out.insert(name.clone(), value.clone());
            } else if let Some(default) = &spec.default {
                out.insert(name.clone(), default.clone());
            }
        }
        out
    }

    /// Canonical serialization of the document (schema identity + effective
    /// fields + deletion marker).
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, SchemaError> {
        let mut body = serde_json::Map::new();
        body.insert(
            "ns".to_string(),
            serde_json::Value::String(self.schema.namespace.clone()),
        );
        body.insert("ver".to_string(), self.schema.version.into());
        body.insert("del".to_string(), self.deleted.into());
        let mut fields = serde_json::Map::new();
        for (name, value) in self.effective_fields() {
            fields.insert(name, canonical::to_canonical_json(&value)?);
        }
        body.insert("f".to_string(), serde_json::Value::Object(fields));
        Ok(serde_json::to_vec(&serde_json::Value::Object(body))
            .expect("canonical item serializes"))
    }

    /// Canonical-form equality.
    pub fn equals(&self, other: &Item) -> bool {
        match (self.canonical_bytes(), other.canonical_bytes()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Stable digest of the canonical form; the validity basis for deltas.
    pub fn checksum(&self) -> Result<ContentHash, SchemaError> {
        Ok(ContentHash::compute(&self.canonical_bytes()?))
    }

    /// Compact per-field change set turning `self` into `target`.
    pub fn diff(&self, target: &Item) -> Result<ChangeSet, SchemaError> {
        let base_fields = self.effective_fields();
        let target_fields = target.effective_fields();
        let mut changes = BTreeMap::new();

        for (field, target_value) in &target_fields {
            match base_fields.get(field) {
                Some(base_value) if base_value.canonical_eq(target_value) => {}
                Some(base_value) => {
                    changes.insert(
                        field.clone(),
                        diff_field_values(base_value, target_value),
                    );
                }
                None => {
                    changes.insert(field.clone(), FieldChange::Set(target_value.clone()));
                }
            }
        }
        for field in base_fields.keys() {
            if !target_fields.contains_key(field) {
                changes.insert(field.clone(), FieldChange::Clear);
            }
        }

        Ok(ChangeSet {
            base_checksum: Some(self.checksum()?),
            changes,
        })
    }

    /// Apply a change set. Unknown fields are rejected by the type check;
    /// container changes merge into the current value so concurrent patches
    /// commute per the field merge rules.
    pub fn patch(&mut self, changes: &ChangeSet) -> Result<(), SchemaError> {
        for (field, change) in &changes.changes {
            match change {
                FieldChange::Set(value) => self.set(field.clone(), value.clone())?,
                FieldChange::Clear => self.clear(field),
                FieldChange::SetDelta { added, removed } => {
                    let mut current = self
                        .fields
                        .get(field)
                        .cloned()
                        .unwrap_or(Value::Set(vec![]));
                    for member in removed {
                        current.set_remove(member);
                    }
                    for member in added {
                        current.set_insert(member.clone());
                    }
                    self.set(field.clone(), current)?;
                }
                FieldChange::ListSplice(ops) => {
                    let mut current = match self.fields.get(field) {
                        Some(Value::List(items)) => items.clone(),
                        _ => vec![],
                    };
                    changeset::apply_splices(&mut current, ops);
                    self.set(field.clone(), Value::List(current))?;
                }
                FieldChange::MapDelta(delta) => {
                    let mut current = match self.fields.get(field) {
                        Some(Value::Map(map)) => map.clone(),
                        _ => BTreeMap::new(),
                    };
                    for (key, entry) in delta {
                        match entry {
                            MapEntryChange::Set(value) => {
                                current.insert(key.clone(), value.clone());
                            }
                            MapEntryChange::Remove => {
                                current.remove(key);
                            }
                        }
                    }
                    self.set(field.clone(), Value::Map(current))?;
                }
                FieldChange::RichTextEdit(edits) => {
                    let mut current = match self.fields.get(field) {
                        Some(Value::RichText(rt)) => rt.clone(),
                        _ => RichText::new(),
                    };
                    current.apply_edits(edits);
                    self.set(field.clone(), Value::RichText(current))?;
                }
            }
        }
        Ok(())
    }

    /// Snapshot form for commits and the wire.
    pub fn to_snapshot(&self) -> Result<ItemSnapshot, SchemaError> {
        let mut fields = BTreeMap::new();
        for (name, value) in self.effective_fields() {
            fields.insert(name, canonical::to_canonical_json(&value)?);
        }
        Ok(ItemSnapshot {
            namespace: self.schema.namespace.clone(),
            version: self.schema.version,
            fields,
            deleted: self.deleted,
        })
    }

    /// Rebuild from a snapshot under the given schema. The caller resolves
    /// the schema (and any upgrade chain) through the registry first.
    pub fn from_snapshot(snapshot: &ItemSnapshot, schema: Arc<Schema>) -> Result<Self, SchemaError> {
        let mut item = Item::new(schema);
        for (name, json) in &snapshot.fields {
            let value = canonical::from_canonical_json(json)?;
            item.set(name.clone(), value)?;
        }
        item.deleted = snapshot.deleted;
        item.dirty.clear();
        Ok(item)
    }
}

/// Choose the most compact change representation for a pair of values of
/// the same field.
fn diff_field_values(base: &Value, target: &Value) -> FieldChange {
    match (base, target) {
        (Value::Set(b), Value::Set(t)) => changeset::diff_sets(b, t),
        (Value::List(b), Value::List(t)) => changeset::diff_lists(b, t),
        (Value::Map(b), Value::Map(t)) => changeset::diff_maps(b, t),
        (Value::RichText(b), Value::RichText(t)) => {
            FieldChange::RichTextEdit(diff_flat(&b.flatten(), &t.flatten()))
        }
        _ => FieldChange::Set(target.clone()),
    }
}
