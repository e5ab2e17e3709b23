//! Deterministic three-way merge of a key's leaf commits.
//!
//! Given the current leaves of a key, the merge materializes each leaf,
//! picks a base (the lowest common ancestor contained in every leaf's
//! ancestry, else the schema null-item), merges field by field, and emits a
//! synthetic commit whose parents are the leaves. Determinism is the
//! central invariant: every choice below (leaf precedence, hunk conflict
//! resolution, parent ordering, the synthesized timestamp) is a pure
//! function of the leaf set, so two peers holding the same leaves produce
//! byte-identical merge commits.
//!
//! Precedence everywhere is the commit tie-break `(timestamp, id)`
//! ascending; the highest-precedence writer wins conflicts (last writer
//! wins).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{DbError, GraphError, SchemaError};
use crate::hash::CommitId;
use crate::internal::commit::{Commit, CommitContents};
use crate::internal::graph::CommitGraph;
use crate::internal::item::{Item, changeset};
use crate::internal::schema::SchemaRegistry;
use crate::internal::value::richtext::{FlatAtom, RichText};
use crate::internal::value::{Value, cmp_values};

/// Non-fatal diagnostic: a field could not be merged structurally and fell
/// back to the tie-break winner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeFallback {
    pub key: String,
    pub field: String,
}

/// Result of merging a leaf set.
pub struct MergeOutcome {
    /// Synthetic commit with the leaves as parents. Unsigned: its integrity
    /// rides on the content address, which every peer reproduces.
    pub commit: Commit,
    /// The merged document.
    pub item: Item,
    /// Fields that resolved by fallback rather than by structural merge.
    pub fallbacks: Vec<MergeFallback>,
}

/// Materialize the document at `commit_id`, resolving delta contents
/// against their base chain.
pub fn materialize(
    graph: &CommitGraph,
    registry: &SchemaRegistry,
    commit_id: &CommitId,
) -> Result<Item, DbError> {
    let commit = graph
        .get(commit_id)
        .ok_or_else(|| GraphError::UnknownParent(commit_id.to_hex()))?;
    match &commit.contents {
        CommitContents::Snapshot(snapshot) => {
            let schema = registry.get(&snapshot.namespace, snapshot.version)?;
            let item = Item::from_snapshot(snapshot, schema)?;
            let latest = registry.latest_version(&snapshot.namespace)?;
            Ok(registry.upgrade(item, latest)?)
        }
        CommitContents::Delta { base, ops } => {
            let mut item = materialize(graph, registry, base)?;
            if let Some(expected) = &ops.base_checksum {
                let actual = item.checksum()?;
                if actual != *expected {
                    tracing::warn!(
                        "delta base checksum mismatch for commit {}: expected {expected}, got {actual}",
                        commit.id
                    );
                }
            }
            item.patch(ops)?;
            Ok(item)
        }
    }
}

/// Merge the given leaves of `key` into one synthetic commit.
///
/// `leaf_ids` must name at least two commits present in the graph. The
/// output commit reduces the key's head set to a single leaf once inserted.
pub fn merge_leaves(
    graph: &CommitGraph,
    registry: &SchemaRegistry,
    key: &str,
    leaf_ids: &[CommitId],
) -> Result<MergeOutcome, DbError> {
    assert!(leaf_ids.len() >= 2, "merge requires at least two leaves");

    // Leaves in precedence order: tie-break ascending, last writer last.
    let mut leaves: Vec<&Commit> = leaf_ids
        .iter()
        .map(|id| {
            graph
                .get(id)
                .ok_or_else(|| GraphError::UnknownParent(id.to_hex()))
        })
        .collect::<Result<_, _>>()?;
    leaves.sort_by_key(|c| c.tie_break_key());

    let leaf_items: Vec<Item> = leaves
        .iter()
        .map(|c| materialize(graph, registry, &c.id))
        .collect::<Result<_, _>>()?;

    let namespace = leaf_items[0].schema().namespace.clone();
    let schema = registry.get(&namespace, registry.latest_version(&namespace)?)?;

    let base_item = match select_base(graph, leaf_ids) {
        Some(base_id) => materialize(graph, registry, &base_id)?,
        None => Item::null_of(schema.clone()),
    };

    let mut merged = Item::null_of(schema.clone());
    let mut fallbacks = Vec::new();

    for (field, spec) in &schema.fields {
        let base_value = base_item.get(field).cloned().unwrap_or(Value::Null);
        // Leaves that actually changed this field relative to the base,
        // still in precedence order.
        let changed: Vec<(usize, Value)> = leaf_items
            .iter()
            .enumerate()
            .map(|(i, item)| (i, item.get(field).cloned().unwrap_or(Value::Null)))
            .filter(|(_, v)| !v.canonical_eq(&base_value))
            .collect();

        let merged_value = match changed.len() {
            0 => base_value,
            1 => changed[0].1.clone(),
            _ => {
                let structural = matches!(
                    spec.kind,
                    crate::internal::value::ValueKind::Set
                        | crate::internal::value::ValueKind::List
                        | crate::internal::value::ValueKind::Map
                        | crate::internal::value::ValueKind::RichText
                );
                if structural && changed.iter().all(|(_, v)| same_shape(&base_value, v)) {
                    merge_field(&base_value, &changed)
                } else if structural {
                    // Schema drift: shapes disagree, keep the last writer.
                    tracing::warn!("merge fallback for key {key} field {field}");
                    fallbacks.push(MergeFallback {
                        key: key.to_string(),
                        field: field.clone(),
                    });
                    changed.last().expect("changed non-empty").1.clone()
                } else {
                    // Scalars: last writer wins.
                    changed.last().expect("changed non-empty").1.clone()
                }
            }
        };
        if !merged_value.is_null() {
            merged
                .set(field.clone(), merged_value)
                .map_err(DbError::Schema)?;
        }
    }

    // Deletion is last-writer-wins like any scalar.
    let base_deleted = base_item.is_deleted();
    let deleted_votes: Vec<bool> = leaf_items
        .iter()
        .map(|i| i.is_deleted())
        .filter(|d| *d != base_deleted)
        .collect();
    if let Some(flip) = deleted_votes.last() {
        merged.set_deleted(*flip);
    } else {
        merged.set_deleted(base_deleted);
    }

    // Synthesized commit metadata is drawn from the highest-precedence
    // leaf, which every peer identifies identically.
    let winner = leaves.last().expect("at least two leaves");
    let timestamp = leaves.iter().map(|c| c.timestamp).max().expect("leaves");
    let mut parents: Vec<CommitId> = leaves.iter().map(|c| c.id).collect();
    parents.sort();

    let commit = Commit::new(
        key,
        winner.session.clone(),
        timestamp,
        winner.build_version.clone(),
        parents,
        CommitContents::Snapshot(merged.to_snapshot().map_err(DbError::Schema)?),
    );

    Ok(MergeOutcome {
        commit,
        item: merged,
        fallbacks,
    })
}

/// The merge base: among pairwise LCAs, the one contained in every leaf's
/// ancestry; none when the leaves share no history.
fn select_base(graph: &CommitGraph, leaf_ids: &[CommitId]) -> Option<CommitId> {
    let mut candidates: Vec<CommitId> = Vec::new();
    for (i, a) in leaf_ids.iter().enumerate() {
        for b in &leaf_ids[i + 1..] {
            if let Some(lca) = graph.lca(a, b) {
                if !candidates.contains(&lca) {
                    candidates.push(lca);
                }
            }
        }
    }
    candidates.retain(|candidate| {
        leaf_ids
            .iter()
            .all(|leaf| graph.is_ancestor_or_self(candidate, leaf))
    });
    candidates
        .into_iter()
        .max_by_key(|id| graph.get(id).map(|c| c.tie_break_key()).unwrap_or((i64::MIN, *id)))
}

fn same_shape(base: &Value, leaf: &Value) -> bool {
    match (base, leaf) {
        // A field absent in the base merges structurally against the empty
        // container of the leaf's shape.
        (Value::Null, _) => true,
        (Value::Set(_), Value::Set(_)) => true,
        (Value::List(_), Value::List(_)) => true,
        (Value::Map(_), Value::Map(_)) => true,
        (Value::RichText(_), Value::RichText(_)) => true,
        _ => false,
    }
}

/// Structural merge of one field across 2+ changed leaves, precedence
/// ascending.
fn merge_field(base: &Value, changed: &[(usize, Value)]) -> Value {
    match changed.last().map(|(_, v)| v) {
        Some(Value::Set(_)) => merge_sets(base, changed),
        Some(Value::List(_)) => merge_lists(base, changed),
        Some(Value::Map(_)) => merge_maps(base, changed),
        Some(Value::RichText(_)) => merge_richtext(base, changed),
        _ => changed.last().expect("changed non-empty").1.clone(),
    }
}

/// Sets: union of additions minus union of removals, relative to the base.
/// A member removed by one writer and untouched by another stays removed;
/// additions always survive.
fn merge_sets(base: &Value, changed: &[(usize, Value)]) -> Value {
    let base_members = match base {
        Value::Set(m) => m.clone(),
        _ => vec![],
    };
    let leaf_members = |leaf: &Value| -> Vec<Value> {
        match leaf {
            Value::Set(m) => m.clone(),
            _ => vec![],
        }
    };
    let mut merged = Value::Set(base_members.clone());
    for (_, leaf) in changed {
        if let changeset::FieldChange::SetDelta { removed, .. } =
            changeset::diff_sets(&base_members, &leaf_members(leaf))
        {
            for member in &removed {
                merged.set_remove(member);
            }
        }
    }
    for (_, leaf) in changed {
        if let changeset::FieldChange::SetDelta { added, .. } =
            changeset::diff_sets(&base_members, &leaf_members(leaf))
        {
            for member in added {
                merged.set_insert(member);
            }
        }
    }
    merged
}

/// Maps: per-key recursive merge; nested maps recurse, everything else is
/// last-writer-wins per key.
fn merge_maps(base: &Value, changed: &[(usize, Value)]) -> Value {
    let base_map = match base {
        Value::Map(m) => m.clone(),
        _ => BTreeMap::new(),
    };
    let leaf_maps: Vec<&BTreeMap<String, Value>> = changed
        .iter()
        .filter_map(|(_, v)| match v {
            Value::Map(m) => Some(m),
            _ => None,
        })
        .collect();

    let mut keys: Vec<&String> = base_map.keys().collect();
    for map in &leaf_maps {
        for key in map.keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys.sort();

    let mut merged = BTreeMap::new();
    for key in keys {
        let base_entry = base_map.get(key).cloned().unwrap_or(Value::Null);
        let changed_entries: Vec<(usize, Value)> = leaf_maps
            .iter()
            .enumerate()
            .map(|(i, m)| (i, m.get(key).cloned().unwrap_or(Value::Null)))
            .filter(|(_, v)| !v.canonical_eq(&base_entry))
            .collect();
        let value = match changed_entries.len() {
            0 => base_entry,
            1 => changed_entries[0].1.clone(),
            _ => {
                let all_maps = changed_entries
                    .iter()
                    .all(|(_, v)| matches!(v, Value::Map(_)))
                    && matches!(base_entry, Value::Map(_) | Value::Null);
                if all_maps {
                    merge_maps(&base_entry, &changed_entries)
                } else {
                    changed_entries.last().expect("non-empty").1.clone()
                }
            }
        };
        // A key removed by the winning writer stays removed.
        if !value.is_null() {
            merged.insert(key.clone(), value);
        }
    }
    Value::Map(merged)
}

/// Lists: splice merge over canonical element tokens, preserving relative
/// order. Overlapping rewrites resolve to the higher-precedence writer;
/// concurrent inserts at the same index keep both, earlier writer first;
/// concurrent identical removes collapse to one.
fn merge_lists(base: &Value, changed: &[(usize, Value)]) -> Value {
    let base_items = match base {
        Value::List(items) => items.clone(),
        _ => vec![],
    };
    let versions: Vec<Vec<Value>> = changed
        .iter()
        .map(|(_, v)| match v {
            Value::List(items) => items.clone(),
            _ => vec![],
        })
        .collect();

    let base_tokens = tokens_of(&base_items);
    let hunk_lists: Vec<Vec<Hunk<Value>>> = versions
        .iter()
        .map(|version| hunks_between(&base_tokens, &tokens_of(version), version))
        .collect();
    Value::List(apply_hunks(&base_items, merge_hunk_lists(hunk_lists)))
}

/// Rich text: flat-representation merge by character offset with the same
/// hunk machinery; pointers are unioned (higher precedence wins a key) and
/// expired ones purged at the merged timestamp.
fn merge_richtext(base: &Value, changed: &[(usize, Value)]) -> Value {
    let base_rt = match base {
        Value::RichText(rt) => rt.clone(),
        _ => RichText::new(),
    };
    let versions: Vec<&RichText> = changed
        .iter()
        .filter_map(|(_, v)| match v {
            Value::RichText(rt) => Some(rt),
            _ => None,
        })
        .collect();

    let base_atoms = base_rt.flatten();
    let base_tokens: Vec<String> = base_atoms.iter().map(atom_token).collect();
    let hunk_lists: Vec<Vec<Hunk<FlatAtom>>> = versions
        .iter()
        .map(|rt| {
            let atoms = rt.flatten();
            let tokens: Vec<String> = atoms.iter().map(atom_token).collect();
            hunks_between(&base_tokens, &tokens, &atoms)
        })
        .collect();
    let merged_atoms = apply_hunks(&base_atoms, merge_hunk_lists(hunk_lists));
    let mut merged = RichText::from_flat(&merged_atoms);

    let newest_expiry = versions
        .iter()
        .flat_map(|rt| rt.pointers().values())
        .filter_map(|p| p.expiration)
        .max();
    for rt in &versions {
        for (key, pointer) in rt.pointers() {
            merged.set_pointer(key.clone(), pointer.clone());
        }
    }
    if let Some(now) = newest_expiry {
        merged.purge_expired_pointers(now);
    }
    Value::RichText(merged)
}

fn tokens_of(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .map(|v| {
            v.canonical_bytes()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default()
        })
        .collect()
}

fn atom_token(atom: &FlatAtom) -> String {
    match atom {
        FlatAtom::Open(tag) => format!("O:{tag}"),
        FlatAtom::Close => "C".to_string(),
        FlatAtom::Char(c) => format!("T:{c}"),
    }
}

/// One rewrite of `base[start..end]` into `insert`.
#[derive(Debug, Clone, PartialEq)]
struct Hunk<T> {
    start: usize,
    end: usize,
    insert: Vec<T>,
}

fn hunks_between<T: Clone>(base_tokens: &[String], tokens: &[String], items: &[T]) -> Vec<Hunk<T>> {
    use similar::{Algorithm, DiffOp, capture_diff_slices};
    let mut hunks = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, base_tokens, tokens) {
        match op {
            DiffOp::Equal { .. } => {}
            DiffOp::Delete {
                old_index, old_len, ..
            } => hunks.push(Hunk {
                start: old_index,
                end: old_index + old_len,
                insert: vec![],
            }),
            DiffOp::Insert {
                old_index,
                new_index,
                new_len,
            } => hunks.push(Hunk {
                start: old_index,
                end: old_index,
                insert: items[new_index..new_index + new_len].to_vec(),
            }),
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => hunks.push(Hunk {
                start: old_index,
                end: old_index + old_len,
                insert: items[new_index..new_index + new_len].to_vec(),
            }),
        }
    }
    hunks
}

/// Combine per-leaf hunk lists (precedence ascending) into one conflict-free
/// list: higher precedence claims its base ranges first, identical hunks
/// collapse, surviving hunks order by base position with earlier writers'
/// same-position inserts first.
fn merge_hunk_lists<T: Clone + PartialEq>(hunk_lists: Vec<Vec<Hunk<T>>>) -> Vec<(usize, Hunk<T>)> {
    let mut accepted: Vec<(usize, Hunk<T>)> = Vec::new();
    for (precedence, hunks) in hunk_lists.into_iter().enumerate().rev() {
        for hunk in hunks {
            let duplicate = accepted
                .iter()
                .any(|(_, h)| h.start == hunk.start && h.end == hunk.end && h.insert == hunk.insert);
            if duplicate {
                continue;
            }
            let conflicts = accepted
                .iter()
                .any(|(_, h)| hunk.start < h.end && h.start < hunk.end);
            if !conflicts {
                accepted.push((precedence, hunk));
            }
        }
    }
    accepted.sort_by_key(|(precedence, h)| (h.start, h.end, *precedence));
    accepted
}

fn apply_hunks<T: Clone>(base: &[T], hunks: Vec<(usize, Hunk<T>)>) -> Vec<T> {
    let mut out = Vec::with_capacity(base.len());
    let mut pos = 0usize;
    for (_, hunk) in hunks {
        let start = hunk.start.min(base.len());
        let end = hunk.end.min(base.len());
        if start > pos {
            out.extend_from_slice(&base[pos..start]);
            pos = start;
        }
        out.extend(hunk.insert.iter().cloned());
        pos = pos.max(end);
    }
    out.extend_from_slice(&base[pos.min(base.len())..]);
    out
}
