//! The commit DAG for one repository.
//!
//! The graph owns the commit index, per-key head sets, the local age
//! counter, and the bookkeeping for shallow edges (parent ids referenced by
//! a present commit but not themselves present). Insertion is idempotent by
//! commit id; ages are assigned in insertion order and never reused.

use std::collections::{BTreeSet, VecDeque};

use ahash::{AHashMap, AHashSet};

use crate::errors::GraphError;
use crate::hash::CommitId;
use crate::internal::commit::Commit;

#[derive(Default)]
pub struct CommitGraph {
    commits: AHashMap<CommitId, Commit>,
    children: AHashMap<CommitId, Vec<CommitId>>,
    heads: AHashMap<String, BTreeSet<CommitId>>,
    shallow: AHashSet<CommitId>,
    next_age: u64,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn contains(&self, id: &CommitId) -> bool {
        self.commits.contains_key(id)
    }

    pub fn get(&self, id: &CommitId) -> Option<&Commit> {
        self.commits.get(id)
    }

    /// Highest age assigned so far; 0 when empty.
    pub fn max_age(&self) -> u64 {
        self.next_age
    }

    /// Insert a commit if new. Assigns the next local age, links parent
    /// edges (absent parents become shallow edges), and maintains the head
    /// set for the commit's key. Returns false for a duplicate id.
    pub fn add(&mut self, mut commit: Commit) -> Result<bool, GraphError> {
        if self.commits.contains_key(&commit.id) {
            return Ok(false);
        }
        // Content addressing makes a true cycle unconstructible, but a
        // malformed commit claiming one of its descendants as a parent must
        // not corrupt the head index.
        for parent in &commit.parents {
            if self.is_ancestor(&commit.id, parent) {
                return Err(GraphError::Cycle(commit.id.to_hex()));
            }
        }

        self.next_age += 1;
        commit.age = Some(self.next_age);

        for parent in &commit.parents {
            self.children.entry(*parent).or_default().push(commit.id);
            if !self.commits.contains_key(parent) {
                self.shallow.insert(*parent);
            }
        }
        self.shallow.remove(&commit.id);

        let heads = self.heads.entry(commit.key.clone()).or_default();
        for parent in &commit.parents {
            heads.remove(parent);
        }
        // A commit that arrives after its children is not a leaf.
        let has_children = self
            .children
            .get(&commit.id)
            .is_some_and(|c| !c.is_empty());
        if !has_children {
            heads.insert(commit.id);
        }

        self.commits.insert(commit.id, commit);
        Ok(true)
    }

    /// Current head set for a key, ordered by id.
    pub fn leaves(&self, key: &str) -> Vec<CommitId> {
        self.heads
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Keys that currently have at least one head.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .heads
            .iter()
            .filter(|(_, heads)| !heads.is_empty())
            .map(|(k, _)| k.as_str())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Lazy breadth-first ancestor walk, optionally bounded by generation.
    pub fn ancestors(&self, id: &CommitId, bound: Option<u32>) -> AncestorIter<'_> {
        let mut queue = VecDeque::new();
        let mut seen = AHashSet::new();
        if let Some(commit) = self.commits.get(id) {
            for parent in &commit.parents {
                if seen.insert(*parent) {
                    queue.push_back((*parent, 1));
                }
            }
        }
        AncestorIter {
            graph: self,
            queue,
            seen,
            bound,
        }
    }

    /// Whether `anc` is a strict ancestor of `desc`.
    pub fn is_ancestor(&self, anc: &CommitId, desc: &CommitId) -> bool {
        self.ancestors(desc, None).any(|id| id == *anc)
    }

    /// Whether `anc` is `desc` or one of its ancestors.
    pub fn is_ancestor_or_self(&self, anc: &CommitId, desc: &CommitId) -> bool {
        anc == desc || self.is_ancestor(anc, desc)
    }

    /// Lowest common ancestor of `a` and `b`, probing from the shallower
    /// side. Among equally-low candidates the tie-break picks the highest
    /// `(timestamp, id)`, which keeps the choice identical on every peer.
    pub fn lca(&self, a: &CommitId, b: &CommitId) -> Option<CommitId> {
        if !self.commits.contains_key(a) || !self.commits.contains_key(b) {
            return None;
        }
        if self.is_ancestor_or_self(a, b) {
            return Some(*a);
        }
        if self.is_ancestor_or_self(b, a) {
            return Some(*b);
        }

        let depth_a = self.ancestors(a, None).count();
        let depth_b = self.ancestors(b, None).count();
        let (probe, walk) = if depth_a <= depth_b { (a, b) } else { (b, a) };

        let probe_set: AHashSet<CommitId> = {
            let mut set: AHashSet<CommitId> = self.ancestors(probe, None).collect();
            set.insert(*probe);
            set
        };

        // Walk the other side in generation order; the first generation
        // containing any hit holds the lowest common ancestors.
        let mut queue: VecDeque<(CommitId, u32)> = VecDeque::new();
        let mut seen = AHashSet::new();
        queue.push_back((*walk, 0));
        seen.insert(*walk);
        let mut hits: Vec<CommitId> = Vec::new();
        let mut hit_generation: Option<u32> = None;

        while let Some((id, generation)) = queue.pop_front() {
            if let Some(done_at) = hit_generation {
                if generation > done_at {
                    break;
                }
            }
            if probe_set.contains(&id) {
                hit_generation.get_or_insert(generation);
                hits.push(id);
                continue;
            }
            if let Some(commit) = self.commits.get(&id) {
                for parent in &commit.parents {
                    if seen.insert(*parent) {
                        queue.push_back((*parent, generation + 1));
                    }
                }
            }
        }

        hits.into_iter().max_by_key(|id| {
            self.commits
                .get(id)
                .map(|c| c.tie_break_key())
                .unwrap_or((i64::MIN, *id))
        })
    }

    /// Ordered ancestor chain from `from` down to `to`, inclusive, or none
    /// if `to` is not reachable.
    pub fn path(&self, from: &CommitId, to: &CommitId) -> Option<Vec<CommitId>> {
        if from == to {
            return Some(vec![*from]);
        }
        let mut predecessor: AHashMap<CommitId, CommitId> = AHashMap::new();
        let mut queue = VecDeque::new();
        queue.push_back(*from);
        while let Some(id) = queue.pop_front() {
            if let Some(commit) = self.commits.get(&id) {
                // Deterministic expansion order for equal-length paths.
                let mut parents = commit.parents.clone();
                parents.sort();
                for parent in parents {
                    if parent != *from && !predecessor.contains_key(&parent) {
                        predecessor.insert(parent, id);
                        if parent == *to {
                            // Oldest first: to → … → from.
                            let mut chain = vec![parent];
                            let mut cursor = id;
                            chain.push(cursor);
                            while let Some(prev) = predecessor.get(&cursor) {
                                cursor = *prev;
                                chain.push(cursor);
                            }
                            return Some(chain);
                        }
                        queue.push_back(parent);
                    }
                }
            }
        }
        None
    }

    /// Parent ids referenced locally but not present: the fetch list for
    /// the next sync round.
    pub fn shallow_edges(&self) -> Vec<CommitId> {
        let mut edges: Vec<CommitId> = self.shallow.iter().copied().collect();
        edges.sort();
        edges
    }

    /// All commits with `age > floor`, ascending by age. The query engine's
    /// incremental feed.
    pub fn commits_since(&self, floor: u64) -> Vec<&Commit> {
        let mut commits: Vec<&Commit> = self
            .commits
            .values()
            .filter(|c| c.age.unwrap_or(0) > floor)
            .collect();
        commits.sort_by_key(|c| c.age.unwrap_or(0));
        commits
    }

    /// All commit ids, unordered.
    pub fn ids(&self) -> impl Iterator<Item = &CommitId> {
        self.commits.keys()
    }

    /// All commits ordered by age; the sync batch feed.
    pub fn commits_by_age(&self) -> Vec<&Commit> {
        self.commits_since(0)
    }
}

/// Lazy BFS ancestor iterator; yields each ancestor id once.
pub struct AncestorIter<'a> {
    graph: &'a CommitGraph,
    queue: VecDeque<(CommitId, u32)>,
    seen: AHashSet<CommitId>,
    bound: Option<u32>,
}

impl Iterator for AncestorIter<'_> {
    type Item = CommitId;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((id, generation)) = self.queue.pop_front() {
            if let Some(bound) = self.bound {
                if generation > bound {
                    continue;
                }
            }
            if let Some(commit) = self.graph.commits.get(&id) {
                for parent in &commit.parents {
                    if self.seen.insert(*parent) {
                        self.queue.push_back((*parent, generation + 1));
                    }
                }
            }
            return Some(id);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::internal::commit::CommitContents;
    use crate::internal::item::ItemSnapshot;

    fn commit(key: &str, marker: &str, ts: i64, parents: Vec<CommitId>) -> Commit {
        let mut fields = BTreeMap::new();
        fields.insert("text".to_string(), serde_json::json!(marker));
        Commit::new(
            key,
            "sess",
            ts,
            "0.7.0",
            parents,
            CommitContents::Snapshot(ItemSnapshot {
                namespace: "task".to_string(),
                version: 1,
                fields,
                deleted: false,
            }),
        )
    }

    #[test]
    fn add_is_idempotent_and_assigns_ages() {
        let mut graph = CommitGraph::new();
        let c = commit("/t/1", "a", 1, vec![]);
        assert!(graph.add(c.clone()).unwrap());
        assert!(!graph.add(c.clone()).unwrap());
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get(&c.id).unwrap().age, Some(1));
    }

    #[test]
    fn heads_track_the_frontier() {
        let mut graph = CommitGraph::new();
        let a = commit("/t/1", "a", 1, vec![]);
        let b = commit("/t/1", "b", 2, vec![a.id]);
        graph.add(a.clone()).unwrap();
        graph.add(b.clone()).unwrap();
        assert_eq!(graph.leaves("/t/1"), vec![b.id]);

        // A concurrent branch from the same parent yields two leaves.
        let c = commit("/t/1", "c", 2, vec![a.id]);
        graph.add(c.clone()).unwrap();
        let mut expected = vec![b.id, c.id];
        expected.sort();
        assert_eq!(graph.leaves("/t/1"), expected);
    }

    #[test]
    fn late_parent_is_not_a_leaf() {
        let mut graph = CommitGraph::new();
        let a = commit("/t/1", "a", 1, vec![]);
        let b = commit("/t/1", "b", 2, vec![a.id]);
        graph.add(b.clone()).unwrap();
        assert_eq!(graph.shallow_edges(), vec![a.id]);
        graph.add(a.clone()).unwrap();
        assert!(graph.shallow_edges().is_empty());
        assert_eq!(graph.leaves("/t/1"), vec![b.id]);
    }

    #[test]
    fn ancestors_walk_is_bounded() {
        let mut graph = CommitGraph::new();
        let a = commit("/t/1", "a", 1, vec![]);
        let b = commit("/t/1", "b", 2, vec![a.id]);
        let c = commit("/t/1", "c", 3, vec![b.id]);
        graph.add(a.clone()).unwrap();
        graph.add(b.clone()).unwrap();
        graph.add(c.clone()).unwrap();
        let all: Vec<CommitId> = graph.ancestors(&c.id, None).collect();
        assert_eq!(all, vec![b.id, a.id]);
        let bounded: Vec<CommitId> = graph.ancestors(&c.id, Some(1)).collect();
        assert_eq!(bounded, vec![b.id]);
    }

    #[test]
    fn lca_of_branches_is_fork_point() {
        let mut graph = CommitGraph::new();
        let root = commit("/t/1", "root", 1, vec![]);
        let left = commit("/t/1", "left", 2, vec![root.id]);
        let right = commit("/t/1", "right", 3, vec![root.id]);
        graph.add(root.clone()).unwrap();
        graph.add(left.clone()).unwrap();
        graph.add(right.clone()).unwrap();
        assert_eq!(graph.lca(&left.id, &right.id), Some(root.id));
        assert_eq!(graph.lca(&root.id, &left.id), Some(root.id));
    }

    #[test]
    fn lca_none_without_common_ancestor() {
        let mut graph = CommitGraph::new();
        let a = commit("/t/1", "a", 1, vec![]);
        let b = commit("/t/1", "b", 2, vec![]);
        graph.add(a.clone()).unwrap();
        graph.add(b.clone()).unwrap();
        assert_eq!(graph.lca(&a.id, &b.id), None);
    }

    #[test]
    fn path_finds_ancestor_chain() {
        let mut graph = CommitGraph::new();
        let a = commit("/t/1", "a", 1, vec![]);
        let b = commit("/t/1", "b", 2, vec![a.id]);
        let c = commit("/t/1", "c", 3, vec![b.id]);
        graph.add(a.clone()).unwrap();
        graph.add(b.clone()).unwrap();
        graph.add(c.clone()).unwrap();
        assert_eq!(graph.path(&c.id, &a.id), Some(vec![a.id, b.id, c.id]));
        assert_eq!(graph.path(&a.id, &c.id), None);
    }

    #[test]
    fn merge_commit_contributes_both_edges() {
        let mut graph = CommitGraph::new();
        let root = commit("/t/1", "root", 1, vec![]);
        let left = commit("/t/1", "left", 2, vec![root.id]);
        let right = commit("/t/1", "right", 3, vec![root.id]);
        let merge = commit("/t/1", "merge", 4, vec![left.id, right.id]);
        graph.add(root.clone()).unwrap();
        graph.add(left.clone()).unwrap();
        graph.add(right.clone()).unwrap();
        graph.add(merge.clone()).unwrap();
        assert_eq!(graph.leaves("/t/1"), vec![merge.id]);
        let ancestors: AHashSet<CommitId> = graph.ancestors(&merge.id, None).collect();
        assert!(ancestors.contains(&left.id));
        assert!(ancestors.contains(&right.id));
        assert!(ancestors.contains(&root.id));
    }

    #[test]
    fn commits_since_orders_by_age() {
        let mut graph = CommitGraph::new();
        let a = commit("/t/1", "a", 5, vec![]);
        let b = commit("/t/2", "b", 3, vec![]);
        graph.add(a.clone()).unwrap();
        graph.add(b.clone()).unwrap();
        let since: Vec<u64> = graph
            .commits_since(0)
            .iter()
            .map(|c| c.age.unwrap())
            .collect();
        assert_eq!(since, vec![1, 2]);
        assert_eq!(graph.commits_since(1).len(), 1);
    }
}
