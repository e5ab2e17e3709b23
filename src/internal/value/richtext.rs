//! Rich text trees.
//!
//! A rich text value is a tree of element and text nodes held in an arena
//! (`Vec<RtNode>` plus stable indices, no linked pointers), with inline
//! pointers marking anchor/focus positions. The tree has an equivalent
//! *flat representation*: a sequence of [`FlatAtom`]s (element open/close
//! markers and individual characters). Diffing and merging operate on the
//! flat form; the tree is rebuilt from it afterwards.
//!
//! Mutators bump an internal version counter. A [`TextWalker`] snapshot of
//! that counter fails fast if the tree is mutated mid-iteration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffOp, capture_diff_slices};

/// Arena index of a node.
pub type RtNodeId = u32;

const ROOT: RtNodeId = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RtNodeKind {
    /// An element with a tag name, e.g. `p` or `em`. Only elements have
    /// children.
    Element { tag: String },
    /// A run of text.
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtNode {
    pub kind: RtNodeKind,
    pub children: Vec<RtNodeId>,
}

/// Direction of a selection pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerDirection {
    Forward,
    Backward,
}

/// An anchor/focus position in the flat character space of a rich text
/// value, with an optional expiration (ms since epoch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pointer {
    pub anchor: usize,
    pub focus: usize,
    pub direction: PointerDirection,
    pub expiration: Option<i64>,
}

impl Pointer {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration.is_some_and(|exp| exp <= now_ms)
    }
}

/// One atom of the flat representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlatAtom {
    Open(String),
    Close,
    Char(char),
}

impl FlatAtom {
    /// Token form used for diffing; distinct prefixes keep markers and
    /// characters from ever colliding.
    fn token(&self) -> String {
        match self {
            FlatAtom::Open(tag) => format!("O:{tag}"),
            FlatAtom::Close => "C".to_string(),
            FlatAtom::Char(c) => format!("T:{c}"),
        }
    }
}

/// One step of a rich text edit script over the flat representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RtEdit {
    Retain(usize),
    Delete(usize),
    Insert(Vec<FlatAtom>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RichText {
    nodes: Vec<RtNode>,
    pointers: BTreeMap<String, Pointer>,
    #[serde(skip)]
    version: u64,
}

impl PartialEq for RichText {
    fn eq(&self, other: &Self) -> bool {
        // The version counter is local bookkeeping, not content.
        self.nodes == other.nodes && self.pointers == other.pointers
    }
}

impl Default for RichText {
    fn default() -> Self {
        Self::new()
    }
}

impl RichText {
    /// An empty tree: a root element with no children.
    pub fn new() -> Self {
        RichText {
            nodes: vec![RtNode {
                kind: RtNodeKind::Element {
                    tag: "root".to_string(),
                },
                children: vec![],
            }],
            pointers: BTreeMap::new(),
            version: 0,
        }
    }

    /// A tree holding a single text run.
    pub fn plain(text: &str) -> Self {
        let mut rt = RichText::new();
        if !text.is_empty() {
            let id = rt.push_node(RtNode {
                kind: RtNodeKind::Text {
                    text: text.to_string(),
                },
                children: vec![],
            });
            rt.nodes[ROOT as usize].children.push(id);
        }
        rt
    }

    fn push_node(&mut self, node: RtNode) -> RtNodeId {
        self.nodes.push(node);
        (self.nodes.len() - 1) as RtNodeId
    }

    /// Flatten the tree into its atom sequence. The root element itself is
    /// not emitted.
    pub fn flatten(&self) -> Vec<FlatAtom> {
        let mut atoms = Vec::new();
        self.flatten_into(ROOT, true, &mut atoms);
        atoms
    }

    fn flatten_into(&self, id: RtNodeId, is_root: bool, out: &mut Vec<FlatAtom>) {
        let node = &self.nodes[id as usize];
        match &node.kind {
            RtNodeKind::Element { tag } => {
                if !is_root {
                    out.push(FlatAtom::Open(tag.clone()));
                }
                for child in &node.children {
                    self.flatten_into(*child, false, out);
                }
                if !is_root {
                    out.push(FlatAtom::Close);
                }
            }
            RtNodeKind::Text { text } => {
                out.extend(text.chars().map(FlatAtom::Char));
            }
        }
    }

    /// Token sequence of the flat form, usable for ordering and diffing.
    pub fn flat_tokens(&self) -> Vec<String> {
        self.flatten().iter().map(FlatAtom::token).collect()
    }

    /// Rebuild a tree from a flat atom sequence. Stray `Close` atoms are
    /// dropped; unclosed elements are closed at the end of input.
    pub fn from_flat(atoms: &[FlatAtom]) -> Self {
        let mut rt = RichText::new();
        let mut stack: Vec<RtNodeId> = vec![ROOT];
        let mut text = String::new();

        fn flush(rt: &mut RichText, stack: &[RtNodeId], text: &mut String) {
            if text.is_empty() {
                return;
            }
            let node = RtNode {
                kind: RtNodeKind::Text {
                    text: std::mem::take(text),
                },
                children: vec![],
            };
            let id = rt.push_node(node);
            let parent = *stack.last().expect("stack never empty");
            rt.nodes[parent as usize].children.push(id);
        }

        for atom in atoms {
            match atom {
                FlatAtom::Char(c) => text.push(*c),
                FlatAtom::Open(tag) => {
                    flush(&mut rt, &stack, &mut text);
                    let id = rt.push_node(RtNode {
                        kind: RtNodeKind::Element { tag: tag.clone() },
                        children: vec![],
                    });
                    let parent = *stack.last().expect("stack never empty");
                    rt.nodes[parent as usize].children.push(id);
                    stack.push(id);
                }
                FlatAtom::Close => {
                    flush(&mut rt, &stack, &mut text);
                    if stack.len() > 1 {
                        stack.pop();
                    } else {
                        tracing::warn!("unbalanced close marker in rich text flat form");
                    }
                }
            }
        }
        flush(&mut rt, &stack, &mut text);
        rt
    }

    /// The concatenated text content.
    pub fn plain_text(&self) -> String {
        self.flatten()
            .into_iter()
            .filter_map(|a| match a {
                FlatAtom::Char(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Number of characters (markers excluded).
    pub fn char_len(&self) -> usize {
        self.flatten()
            .iter()
            .filter(|a| matches!(a, FlatAtom::Char(_)))
            .count()
    }

    /// Insert text at a character offset, clamped to the end.
    pub fn insert_text(&mut self, offset: usize, text: &str) {
        let mut atoms = self.flatten();
        let at = atom_index_for_char(&atoms, offset);
        atoms.splice(at..at, text.chars().map(FlatAtom::Char));
        self.rebuild(atoms);
        let inserted = text.chars().count();
        for ptr in self.pointers.values_mut() {
            if ptr.anchor >= offset {
                ptr.anchor += inserted;
            }
            if ptr.focus >= offset {
                ptr.focus += inserted;
            }
        }
    }

    /// Delete `len` characters starting at a character offset.
    pub fn delete_range(&mut self, offset: usize, len: usize) {
        let mut atoms = self.flatten();
        let start = atom_index_for_char(&atoms, offset);
        let end = atom_index_for_char(&atoms, offset + len);
        // Keep markers inside the range; only characters are removed.
        let kept: Vec<FlatAtom> = atoms[start..end]
            .iter()
            .filter(|a| !matches!(a, FlatAtom::Char(_)))
            .cloned()
            .collect();
        atoms.splice(start..end, kept);
        self.rebuild(atoms);
        for ptr in self.pointers.values_mut() {
            ptr.anchor = remap_after_delete(ptr.anchor, offset, len);
            ptr.focus = remap_after_delete(ptr.focus, offset, len);
        }
    }

    fn rebuild(&mut self, atoms: Vec<FlatAtom>) {
        let pointers = std::mem::take(&mut self.pointers);
        let version = self.version;
        *self = RichText::from_flat(&atoms);
        self.pointers = pointers;
        self.version = version + 1;
    }

    /// Install or move a named pointer.
    pub fn set_pointer(&mut self, key: impl Into<String>, pointer: Pointer) {
        self.version += 1;
        let len = self.char_len();
        let clamped = Pointer {
            anchor: pointer.anchor.min(len),
            focus: pointer.focus.min(len),
            ..pointer
        };
        self.pointers.insert(key.into(), clamped);
    }

    pub fn pointer(&self, key: &str) -> Option<&Pointer> {
        self.pointers.get(key)
    }

    pub fn pointers(&self) -> &BTreeMap<String, Pointer> {
        &self.pointers
    }

    /// Drop every pointer whose expiration has passed. Returns the number
    /// removed.
    pub fn purge_expired_pointers(&mut self, now_ms: i64) -> usize {
        let before = self.pointers.len();
        self.pointers.retain(|_, p| !p.is_expired(now_ms));
        let removed = before - self.pointers.len();
        if removed > 0 {
            self.version += 1;
        }
        removed
    }

    /// Start a cursor over text runs. The cursor holds arena indices, not
    /// borrows; it fails fast if the tree is mutated between `next` calls.
    pub fn walk_text(&self) -> TextCursor {
        TextCursor {
            version: self.version,
            stack: vec![(ROOT, 0)],
        }
    }

    /// Apply an edit script produced by [`diff_flat`] and rebuild.
    pub fn apply_edits(&mut self, edits: &[RtEdit]) {
        let base = self.flatten();
        let pointer_map = char_remap(&base, edits);
        let next = apply_edit_script(&base, edits);
        self.rebuild(next);
        let len = self.char_len();
        for ptr in self.pointers.values_mut() {
            ptr.anchor = pointer_map(ptr.anchor).min(len);
            ptr.focus = pointer_map(ptr.focus).min(len);
        }
    }
}

/// Depth-first cursor over text runs. Holds stable arena indices; each call
/// revalidates the mutation counter and panics if the tree changed since
/// the cursor was created.
pub struct TextCursor {
    version: u64,
    stack: Vec<(RtNodeId, usize)>,
}

impl TextCursor {
    pub fn next<'a>(&mut self, rt: &'a RichText) -> Option<&'a str> {
        assert_eq!(
            self.version, rt.version,
            "rich text mutated during iteration"
        );
        while let Some((id, child_idx)) = self.stack.pop() {
            let node = &rt.nodes[id as usize];
            match &node.kind {
                RtNodeKind::Text { text } => return Some(text),
                RtNodeKind::Element { .. } => {
                    if child_idx < node.children.len() {
                        self.stack.push((id, child_idx + 1));
                        self.stack.push((node.children[child_idx], 0));
                    }
                }
            }
        }
        None
    }
}

/// Index of the atom at which the `offset`-th character starts; markers are
/// skipped over. Clamped to the end of the sequence.
fn atom_index_for_char(atoms: &[FlatAtom], offset: usize) -> usize {
    let mut chars = 0;
    for (i, atom) in atoms.iter().enumerate() {
        if chars == offset && matches!(atom, FlatAtom::Char(_)) {
            return i;
        }
        if let FlatAtom::Char(_) = atom {
            chars += 1;
        }
    }
    atoms.len()
}

fn remap_after_delete(pos: usize, offset: usize, len: usize) -> usize {
    if pos <= offset {
        pos
    } else if pos >= offset + len {
        pos - len
    } else {
        offset
    }
}

/// Diff two flat sequences into an edit script.
pub fn diff_flat(old: &[FlatAtom], new: &[FlatAtom]) -> Vec<RtEdit> {
    let old_tokens: Vec<String> = old.iter().map(FlatAtom::token).collect();
    let new_tokens: Vec<String> = new.iter().map(FlatAtom::token).collect();
    let mut edits = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, &old_tokens, &new_tokens) {
        match op {
            DiffOp::Equal { len, .. } => edits.push(RtEdit::Retain(len)),
            DiffOp::Delete { old_len, .. } => edits.push(RtEdit::Delete(old_len)),
            DiffOp::Insert {
                new_index, new_len, ..
            } => edits.push(RtEdit::Insert(new[new_index..new_index + new_len].to_vec())),
            DiffOp::Replace {
                old_len,
                new_index,
                new_len,
                ..
            } => {
                edits.push(RtEdit::Delete(old_len));
                edits.push(RtEdit::Insert(new[new_index..new_index + new_len].to_vec()));
            }
        }
    }
    edits
}

/// Apply an edit script to a flat sequence.
pub fn apply_edit_script(base: &[FlatAtom], edits: &[RtEdit]) -> Vec<FlatAtom> {
    let mut out = Vec::with_capacity(base.len());
    let mut pos = 0usize;
    for edit in edits {
        match edit {
            RtEdit::Retain(n) => {
                let end = (pos + n).min(base.len());
                out.extend_from_slice(&base[pos..end]);
                pos = end;
            }
            RtEdit::Delete(n) => {
                pos = (pos + n).min(base.len());
            }
            RtEdit::Insert(atoms) => out.extend_from_slice(atoms),
        }
    }
    out.extend_from_slice(&base[pos.min(base.len())..]);
    out
}

/// Build a character-offset remapping function for pointers surviving an
/// edit script.
fn char_remap(base: &[FlatAtom], edits: &[RtEdit]) -> impl Fn(usize) -> usize {
    // map[i] = new char offset corresponding to old char offset i.
    fn consume(range: &[FlatAtom], kept: bool, map: &mut Vec<usize>, new_chars: &mut usize) {
        for atom in range {
            if matches!(atom, FlatAtom::Char(_)) {
                if kept {
                    *new_chars += 1;
                }
                map.push(*new_chars);
            }
        }
    }

    let old_len = base
        .iter()
        .filter(|a| matches!(a, FlatAtom::Char(_)))
        .count();
    let mut map = Vec::with_capacity(old_len + 1);
    let mut new_chars = 0usize;
    map.push(0);

    let mut pos = 0usize;
    for edit in edits {
        match edit {
            RtEdit::Retain(n) => {
                let end = (pos + n).min(base.len());
                consume(&base[pos..end], true, &mut map, &mut new_chars);
                pos = end;
            }
            RtEdit::Delete(n) => {
                let end = (pos + n).min(base.len());
                consume(&base[pos..end], false, &mut map, &mut new_chars);
                pos = end;
            }
            RtEdit::Insert(atoms) => {
                // An insert only advances the new-side offset; old offsets
                // at the boundary stay before the inserted run.
                new_chars += atoms
                    .iter()
                    .filter(|a| matches!(a, FlatAtom::Char(_)))
                    .count();
            }
        }
    }
    consume(&base[pos.min(base.len())..], true, &mut map, &mut new_chars);

    move |old: usize| map.get(old).copied().unwrap_or(new_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_round_trips_through_flat() {
        let rt = RichText::plain("hello");
        let atoms = rt.flatten();
        assert_eq!(atoms.len(), 5);
        assert_eq!(RichText::from_flat(&atoms), rt);
    }

    #[test]
    fn nested_elements_round_trip() {
        let atoms = vec![
            FlatAtom::Open("p".into()),
            FlatAtom::Char('a'),
            FlatAtom::Open("em".into()),
            FlatAtom::Char('b'),
            FlatAtom::Close,
            FlatAtom::Char('c'),
            FlatAtom::Close,
        ];
        let rt = RichText::from_flat(&atoms);
        assert_eq!(rt.flatten(), atoms);
        assert_eq!(rt.plain_text(), "abc");
    }

    #[test]
    fn insert_and_delete_text() {
        let mut rt = RichText::plain("hard");
        rt.insert_text(4, "er");
        assert_eq!(rt.plain_text(), "harder");
        rt.delete_range(0, 4);
        assert_eq!(rt.plain_text(), "er");
    }

    #[test]
    fn pointers_shift_on_insert() {
        let mut rt = RichText::plain("abc");
        rt.set_pointer(
            "caret",
            Pointer {
                anchor: 2,
                focus: 2,
                direction: PointerDirection::Forward,
                expiration: None,
            },
        );
        rt.insert_text(0, "xx");
        assert_eq!(rt.pointer("caret").unwrap().anchor, 4);
    }

    #[test]
    fn expired_pointers_are_purged() {
        let mut rt = RichText::plain("abc");
        rt.set_pointer(
            "old",
            Pointer {
                anchor: 0,
                focus: 1,
                direction: PointerDirection::Backward,
                expiration: Some(100),
            },
        );
        rt.set_pointer(
            "live",
            Pointer {
                anchor: 0,
                focus: 1,
                direction: PointerDirection::Forward,
                expiration: Some(10_000),
            },
        );
        assert_eq!(rt.purge_expired_pointers(5_000), 1);
        assert!(rt.pointer("old").is_none());
        assert!(rt.pointer("live").is_some());
    }

    #[test]
    fn diff_and_apply_reproduce_target() {
        let a = RichText::plain("the quick fox");
        let b = RichText::plain("the slow fox jumps");
        let edits = diff_flat(&a.flatten(), &b.flatten());
        let patched = apply_edit_script(&a.flatten(), &edits);
        assert_eq!(RichText::from_flat(&patched), b);
    }

    #[test]
    fn apply_edits_remaps_pointers() {
        let mut a = RichText::plain("abcdef");
        a.set_pointer(
            "caret",
            Pointer {
                anchor: 5,
                focus: 5,
                direction: PointerDirection::Forward,
                expiration: None,
            },
        );
        let b = RichText::plain("abef");
        let edits = diff_flat(&a.flatten(), &b.flatten());
        a.apply_edits(&edits);
        assert_eq!(a.plain_text(), "abef");
        assert_eq!(a.pointer("caret").unwrap().anchor, 3);
    }

    #[test]
    fn cursor_yields_text_runs_in_order() {
        let atoms = vec![
            FlatAtom::Char('a'),
            FlatAtom::Open("em".into()),
            FlatAtom::Char('b'),
            FlatAtom::Close,
            FlatAtom::Char('c'),
        ];
        let rt = RichText::from_flat(&atoms);
        let mut cursor = rt.walk_text();
        let mut runs = Vec::new();
        while let Some(run) = cursor.next(&rt) {
            runs.push(run.to_string());
        }
        assert_eq!(runs, vec!["a", "b", "c"]);
    }

    #[test]
    #[should_panic(expected = "mutated during iteration")]
    fn cursor_fails_fast_on_mutation() {
        let mut rt = RichText::plain("abc");
        let mut cursor = rt.walk_text();
        cursor.next(&rt);
        rt.insert_text(0, "x");
        cursor.next(&rt);
    }
}
