//! Compact change sets between two documents.
//!
//! A [`ChangeSet`] captures, per field, the smallest description of how one
//! document turned into another: scalar overwrites, explicit clears, set
//! membership deltas, list splices, key-wise map updates, and rich text
//! edit scripts. Change sets serialize into commit delta contents and apply
//! via [`crate::internal::item::Item::patch`]; the per-field shapes are what
//! make concurrent patches commute under the merge rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffOp, capture_diff_slices};

use crate::hash::ContentHash;
use crate::internal::value::richtext::RtEdit;
use crate::internal::value::{Value, cmp_values};

/// Replace-or-remove of one map key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapEntryChange {
    Set(Value),
    Remove,
}

/// One list splice: at `index` in the base, drop `remove` elements and
/// insert `insert` in their place. Ops are ordered by ascending base index
/// and applied with a running offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpliceOp {
    pub index: usize,
    pub remove: usize,
    pub insert: Vec<Value>,
}

/// The change recorded for a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldChange {
    /// Overwrite the field with a new value.
    Set(Value),
    /// Remove the field, reverting reads to the schema default.
    Clear,
    /// Edit script over the rich text flat representation.
    RichTextEdit(Vec<RtEdit>),
    /// Membership delta for a set field.
    SetDelta {
        added: Vec<Value>,
        removed: Vec<Value>,
    },
    /// Ordered splices for a list field.
    ListSplice(Vec<SpliceOp>),
    /// Key-wise updates for a map field.
    MapDelta(BTreeMap<String, MapEntryChange>),
}

/// A set of per-field changes, tagged with the checksum of the document the
/// diff was computed against. Applying a change set to a document with a
/// different checksum is allowed (that is what merging is), but delta
/// commit contents use the checksum to validate reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChangeSet {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub base_checksum: Option<ContentHash>,
    pub changes: BTreeMap<String, FieldChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

/// Diff two set values into added/removed member lists.
pub fn diff_sets(base: &[Value], target: &[Value]) -> FieldChange {
    let added = target
        .iter()
        .filter(|v| {
            base.binary_search_by(|m| cmp_values(m, v)).is_err()
        })
        .cloned()
        .collect();
    let removed = base
        .iter()
        .filter(|v| {
            target.binary_search_by(|m| cmp_values(m, v)).is_err()
        })
        .cloned()
        .collect();
    FieldChange::SetDelta { added, removed }
}

/// Diff two lists into splice ops over canonical element encodings.
pub fn diff_lists(base: &[Value], target: &[Value]) -> FieldChange {
    let base_keys: Vec<String> = base.iter().map(element_key).collect();
    let target_keys: Vec<String> = target.iter().map(element_key).collect();
    let mut ops = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, &base_keys, &target_keys) {
        match op {
            DiffOp::Equal { .. } => {}
            DiffOp::Delete {
                old_index, old_len, ..
            } => ops.push(SpliceOp {
                index: old_index,
                remove: old_len,
                insert: vec![],
            }),
            DiffOp::Insert {
                old_index,
                new_index,
                new_len,
            } => ops.push(SpliceOp {
                index: old_index,
                remove: 0,
                insert: target[new_index..new_index + new_len].to_vec(),
            }),
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => ops.push(SpliceOp {
                index: old_index,
                remove: old_len,
                insert: target[new_index..new_index + new_len].to_vec(),
            }),
        }
    }
    FieldChange::ListSplice(ops)
}

/// Diff two maps key-wise.
pub fn diff_maps(
    base: &BTreeMap<String, Value>,
    target: &BTreeMap<String, Value>,
) -> FieldChange {
    let mut delta = BTreeMap::new();
    for (key, value) in target {
        match base.get(key) {
            Some(existing) if existing.canonical_eq(value) => {}
            _ => {
                delta.insert(key.clone(), MapEntryChange::Set(value.clone()));
            }
        }
    }
    for key in base.keys() {
        if !target.contains_key(key) {
            delta.insert(key.clone(), MapEntryChange::Remove);
        }
    }
    FieldChange::MapDelta(delta)
}

/// Apply splice ops to a list, tracking the running index offset.
pub fn apply_splices(list: &mut Vec<Value>, ops: &[SpliceOp]) {
    let mut offset = 0isize;
    for op in ops {
        let at = ((op.index as isize) + offset).clamp(0, list.len() as isize) as usize;
        let end = (at + op.remove).min(list.len());
        list.splice(at..end, op.insert.iter().cloned());
        offset += op.insert.len() as isize - (end - at) as isize;
    }
}

fn element_key(value: &Value) -> String {
    value
        .canonical_bytes()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}
