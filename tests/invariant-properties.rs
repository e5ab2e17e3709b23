//! Randomized invariants over the pure core: commit id integrity, the
//! diff/patch round trip, merge determinism under leaf reordering, bloom
//! filter membership, and canonical value encoding.

use std::collections::BTreeMap;
use std::sync::Arc;

use goatdb::hash::ContentHash;
use goatdb::internal::commit::{Commit, CommitContents};
use goatdb::internal::graph::CommitGraph;
use goatdb::internal::item::Item;
use goatdb::internal::merge::merge_leaves;
use goatdb::internal::schema::{FieldSpec, Schema, SchemaRegistry};
use goatdb::internal::value::{Value, ValueKind, canonical};
use goatdb::sync::BloomFilter;
use quickcheck::{QuickCheck, TestResult};

fn registry() -> SchemaRegistry {
    let reg = SchemaRegistry::new();
    reg.register(
        Schema::new("doc", 1)
            .field("title", FieldSpec::new(ValueKind::Str))
            .field("count", FieldSpec::new(ValueKind::Int))
            .field("tags", FieldSpec::new(ValueKind::Set))
            .field("steps", FieldSpec::new(ValueKind::List)),
    )
    .unwrap();
    reg
}

fn doc_item(reg: &SchemaRegistry, title: &str, count: i64, tags: &[String], steps: &[i64]) -> Item {
    let schema = reg.get("doc", 1).unwrap();
    let mut item = Item::new(schema);
    item.set("title", Value::Str(title.to_string())).unwrap();
    item.set("count", Value::Int(count)).unwrap();
    let mut tag_set = Value::Set(vec![]);
    for tag in tags {
        tag_set.set_insert(Value::Str(tag.clone()));
    }
    item.set("tags", tag_set).unwrap();
    item.set(
        "steps",
        Value::List(steps.iter().map(|s| Value::Int(*s)).collect()),
    )
    .unwrap();
    item
}

/// Invariant 1: `hash(canonical(commit \ {id, sig, age})) == id`.
#[test]
fn commit_id_integrity() {
    fn prop(key: String, title: String, ts: i64) -> bool {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), serde_json::json!(title));
        let commit = Commit::new(
            format!("/d/{key}"),
            "sess",
            ts,
            "0.7.0",
            vec![],
            CommitContents::Snapshot(goatdb::internal::item::ItemSnapshot {
                namespace: "doc".to_string(),
                version: 1,
                fields,
                deleted: false,
            }),
        );
        commit.verify_id() && commit.id == ContentHash::compute(&commit.payload_bytes())
    }
    QuickCheck::new()
        .tests(50)
        .quickcheck(prop as fn(String, String, i64) -> bool);
}

/// Invariant 5: `patch(a, diff(a, b)) == b` up to canonical form, across
/// scalar, set, and list fields.
#[test]
fn diff_patch_round_trip() {
    fn prop(
        title_a: String,
        title_b: String,
        count: i64,
        tags_a: Vec<String>,
        tags_b: Vec<String>,
        steps_a: Vec<i64>,
        steps_b: Vec<i64>,
    ) -> bool {
        let reg = registry();
        let a = doc_item(&reg, &title_a, count, &tags_a, &steps_a);
        let b = doc_item(&reg, &title_b, count.wrapping_add(1), &tags_b, &steps_b);
        let changes = a.diff(&b).unwrap();
        let mut patched = a.clone();
        patched.patch(&changes).unwrap();
        patched.equals(&b) && patched.checksum().unwrap() == b.checksum().unwrap()
    }
    QuickCheck::new().tests(50).quickcheck(
        prop as fn(String, String, i64, Vec<String>, Vec<String>, Vec<i64>, Vec<i64>) -> bool,
    );
}

/// Invariant 4: merge output is identical whatever order the leaves are
/// given in.
#[test]
fn merge_determinism_under_reordering() {
    fn prop(title_x: String, title_y: String, tags: Vec<String>) -> TestResult {
        let reg = registry();
        let mut graph = CommitGraph::new();

        let base = doc_item(&reg, "base", 0, &[], &[]);
        let root = Commit::new(
            "/d/1",
            "sess",
            100,
            "0.7.0",
            vec![],
            CommitContents::Snapshot(base.to_snapshot().unwrap()),
        );
        let left_item = doc_item(&reg, &title_x, 1, &tags, &[1, 2]);
        let left = Commit::new(
            "/d/1",
            "sess",
            200,
            "0.7.0",
            vec![root.id],
            CommitContents::Snapshot(left_item.to_snapshot().unwrap()),
        );
        let right_item = doc_item(&reg, &title_y, 2, &[], &[3]);
        let right = Commit::new(
            "/d/1",
            "sess",
            300,
            "0.7.0",
            vec![root.id],
            CommitContents::Snapshot(right_item.to_snapshot().unwrap()),
        );
        if left.id == right.id {
            return TestResult::discard();
        }
        graph.add(root).unwrap();
        graph.add(left.clone()).unwrap();
        graph.add(right.clone()).unwrap();

        let forward = merge_leaves(&graph, &reg, "/d/1", &[left.id, right.id]).unwrap();
        let backward = merge_leaves(&graph, &reg, "/d/1", &[right.id, left.id]).unwrap();
        TestResult::from_bool(
            forward.commit.id == backward.commit.id
                && forward.commit.payload_bytes() == backward.commit.payload_bytes(),
        )
    }
    QuickCheck::new()
        .tests(50)
        .quickcheck(prop as fn(String, String, Vec<String>) -> TestResult);
}

/// Bloom filters never report a false negative.
#[test]
fn bloom_has_no_false_negatives() {
    fn prop(members: Vec<Vec<u8>>) -> bool {
        let mut filter = BloomFilter::new(members.len().max(1), 0.01, None);
        for member in &members {
            filter.add(member);
        }
        members.iter().all(|m| filter.contains(m))
    }
    QuickCheck::new()
        .tests(50)
        .quickcheck(prop as fn(Vec<Vec<u8>>) -> bool);
}

/// Canonical encoding round-trips and is insensitive to set insertion
/// order.
#[test]
fn canonical_value_round_trip() {
    fn prop(ints: Vec<i64>, strings: Vec<String>) -> bool {
        let mut forward = Value::Set(vec![]);
        for i in &ints {
            forward.set_insert(Value::Int(*i));
        }
        for s in &strings {
            forward.set_insert(Value::Str(s.clone()));
        }
        let mut reverse = Value::Set(vec![]);
        for s in strings.iter().rev() {
            reverse.set_insert(Value::Str(s.clone()));
        }
        for i in ints.iter().rev() {
            reverse.set_insert(Value::Int(*i));
        }

        let json = canonical::to_canonical_json(&forward).unwrap();
        let back = canonical::from_canonical_json(&json).unwrap();
        back.canonical_eq(&forward) && forward.canonical_eq(&reverse)
    }
    QuickCheck::new()
        .tests(50)
        .quickcheck(prop as fn(Vec<i64>, Vec<String>) -> bool);
}

/// The registry upgrade chain is applied transparently on snapshot loads
/// from an older schema version.
#[test]
fn schema_upgrade_chain_applies() {
    let reg = registry();
    reg.register(
        Schema::new("doc", 2)
            .field("title", FieldSpec::new(ValueKind::Str))
            .field("count", FieldSpec::new(ValueKind::Int))
            .field("tags", FieldSpec::new(ValueKind::Set))
            .field("steps", FieldSpec::new(ValueKind::List))
            .field("archived", FieldSpec::new(ValueKind::Bool)),
    )
    .unwrap();
    reg.register_upgrade(
        "doc",
        1,
        Arc::new(|item: &mut Item| {
            let _ = item.set("archived", Value::Bool(false));
        }),
    );

    let old = doc_item(&reg, "t", 1, &[], &[]);
    let upgraded = reg.upgrade(old, 2).unwrap();
    assert_eq!(upgraded.schema().version, 2);
    assert_eq!(upgraded.get("archived"), Some(&Value::Bool(false)));
}
