//! Compressed-trie key/value dictionary.
//!
//! Every name-based lookup in the runtime (blocks, parameters, ports,
//! thread pools, built-in modules, the module load registry) goes through
//! [`Dict`]. Names are looked up far more often than inserted, so the
//! structure optimizes `find`: each key byte is decomposed into four 2-bit
//! symbols and the trie branches 4 ways per symbol, with runs of
//! single-child symbols compressed into per-node suffixes. Memory grows
//! with the number of distinct prefixes rather than the raw sum of key
//! lengths, which matters for the long colon-hierarchical names
//! (`super:child:subchild:param`) the runtime keeps in one process.
//!
//! Keys are restricted to printable ASCII (0x20..=0x7E). Insert is not
//! optimized; only `find` is.

mod cursor;

pub use cursor::DictCursor;

use crate::error::{QsError, Result};
use std::ops::ControlFlow;

/// Lowest accepted key byte (space).
const KEY_MIN: u8 = 0x20;
/// Highest accepted key byte (tilde).
const KEY_MAX: u8 = 0x7E;

/// Outcome of [`Dict::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// The key was new and the value stored.
    Inserted,
    /// The key already existed; the stored value is unchanged.
    AlreadyPresent,
}

/// Outcome of [`Dict::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remove {
    /// The key existed; its value was consumed by the registered
    /// destructor, or dropped.
    Removed,
    /// No such key.
    NotFound,
}

pub(crate) struct Entry<V> {
    key: String,
    value: Option<V>,
    destructor: Option<Box<dyn FnOnce(V) + Send>>,
}

impl<V> Entry<V> {
    fn new(key: String, value: V) -> Self {
        Self {
            key,
            value: Some(value),
            destructor: None,
        }
    }

    pub(crate) fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }
}

impl<V> Drop for Entry<V> {
    fn drop(&mut self) {
        // The destructor fires exactly once: here, whether the entry dies
        // by remove, retain or dictionary teardown.
        if let (Some(value), Some(destructor)) = (self.value.take(), self.destructor.take()) {
            destructor(value);
        }
    }
}

type Children<V> = [Option<Box<Node<V>>>; 4];

pub(crate) struct Node<V> {
    children: Option<Box<Children<V>>>,
    /// Compressed run of 2-bit symbols leading into this node.
    suffix: Vec<u8>,
    entry: Option<Entry<V>>,
}

impl<V> Node<V> {
    fn empty() -> Self {
        Self {
            children: None,
            suffix: Vec::new(),
            entry: None,
        }
    }

    pub(crate) fn suffix_len(&self) -> usize {
        self.suffix.len()
    }

    pub(crate) fn entry(&self) -> Option<&Entry<V>> {
        self.entry.as_ref()
    }
}

fn empty_children<V>() -> Box<Children<V>> {
    Box::new([None, None, None, None])
}

/// Decompose a key into 2-bit symbols, validating the byte range.
fn encode(key: &str) -> Result<Vec<u8>> {
    let bytes = key.as_bytes();
    if let Some(&byte) = bytes.iter().find(|b| !(KEY_MIN..=KEY_MAX).contains(b)) {
        return Err(QsError::InvalidKey {
            key: key.to_string(),
            byte,
        });
    }
    let mut syms = Vec::with_capacity(bytes.len() * 4);
    for &b in bytes {
        syms.push(b >> 6);
        syms.push((b >> 4) & 3);
        syms.push((b >> 2) & 3);
        syms.push(b & 3);
    }
    Ok(syms)
}

/// Encode without validating; out-of-range keys simply cannot be present.
fn encode_lossy(key: &str) -> Option<Vec<u8>> {
    encode(key).ok()
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Walk from `node` (with `off` suffix symbols already consumed) along
/// `syms`. Returns the resting node and its consumed-suffix offset, which
/// may sit mid-edge inside a compressed suffix.
pub(crate) fn descend<'a, V>(
    mut node: &'a Node<V>,
    mut off: usize,
    syms: &[u8],
) -> Option<(&'a Node<V>, usize)> {
    let mut i = 0;
    loop {
        let rem = &node.suffix[off..];
        let n = rem.len().min(syms.len() - i);
        if syms[i..i + n] != rem[..n] {
            return None;
        }
        i += n;
        off += n;
        if i == syms.len() {
            return Some((node, off));
        }
        let b = syms[i] as usize;
        i += 1;
        node = node.children.as_ref()?[b].as_deref()?;
        off = 0;
    }
}

fn descend_mut<'a, V>(
    mut node: &'a mut Node<V>,
    syms: &[u8],
) -> Option<(&'a mut Node<V>, usize)> {
    let mut i = 0;
    let mut off = 0;
    loop {
        let rem = &node.suffix[off..];
        let n = rem.len().min(syms.len() - i);
        if syms[i..i + n] != rem[..n] {
            return None;
        }
        i += n;
        off += n;
        if i == syms.len() {
            return Some((node, off));
        }
        let b = syms[i] as usize;
        i += 1;
        node = node.children.as_mut()?[b].as_deref_mut()?;
        off = 0;
    }
}

enum RemoveStep {
    NotFound,
    Removed { drop_child: bool },
}

/// A compressed-trie dictionary keyed by printable-ASCII strings.
pub struct Dict<V> {
    root: Node<V>,
    len: usize,
}

impl<V> Default for Dict<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for Dict<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dict").field("len", &self.len).finish()
    }
}

impl<V> Dict<V> {
    /// Create an empty dictionary.
    ///
    /// The top-level 4-way branch array is permanent; it is never pruned,
    /// so an all-null root still answers `is_empty() == true`.
    pub fn new() -> Self {
        let mut root = Node::empty();
        root.children = Some(empty_children());
        Self { root, len: 0 }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a key/value pair.
    ///
    /// Keys containing bytes outside printable ASCII are rejected with
    /// [`QsError::InvalidKey`], leaving the dictionary unchanged — a
    /// distinct failure from [`Insert::AlreadyPresent`], which also never
    /// alters the stored value.
    pub fn insert(&mut self, key: &str, value: V) -> Result<Insert> {
        let syms = encode(key)?;
        let entry = Entry::new(key.to_string(), value);
        let outcome = insert_at(&mut self.root, &syms, 0, entry);
        if outcome == Insert::Inserted {
            self.len += 1;
        }
        Ok(outcome)
    }

    /// Look up a value. O(key length) with a small constant.
    pub fn find(&self, key: &str) -> Option<&V> {
        let syms = encode_lossy(key)?;
        let (node, off) = descend(&self.root, 0, &syms)?;
        if off == node.suffix.len() {
            node.entry.as_ref().and_then(|e| e.value.as_ref())
        } else {
            None
        }
    }

    /// Look up a value mutably.
    pub fn find_mut(&mut self, key: &str) -> Option<&mut V> {
        let syms = encode_lossy(key)?;
        let (node, off) = descend_mut(&mut self.root, &syms)?;
        if off == node.suffix.len() {
            node.entry.as_mut().and_then(|e| e.value.as_mut())
        } else {
            None
        }
    }

    /// Position a cursor on the subtree reached by `key`, enabling
    /// incremental lookups over hierarchical names without building
    /// concatenated strings: `dict.subtree("a")?.find("b")` is equivalent
    /// to `dict.find("ab")`.
    pub fn subtree(&self, key: &str) -> Option<DictCursor<'_, V>> {
        let syms = encode_lossy(key)?;
        let (node, off) = descend(&self.root, 0, &syms)?;
        Some(DictCursor::new(node, off))
    }

    /// Remove a key.
    ///
    /// Fires the entry's destructor if one was registered, otherwise drops
    /// the value. Emptied nodes are pruned and single-child nodes absorbed
    /// upward so that every internal node keeps at least one live
    /// descendant.
    pub fn remove(&mut self, key: &str) -> Remove {
        let Some(syms) = encode_lossy(key) else {
            return Remove::NotFound;
        };
        match remove_at(&mut self.root, &syms, 0, true) {
            RemoveStep::NotFound => Remove::NotFound,
            RemoveStep::Removed { .. } => {
                self.len -= 1;
                Remove::Removed
            }
        }
    }

    /// Register a destructor for the value stored under `key`.
    ///
    /// The destructor is invoked exactly once, by `remove`, by a
    /// discarding `retain`, or by dictionary teardown. Returns false when
    /// the key does not exist.
    pub fn set_destructor(&mut self, key: &str, f: impl FnOnce(V) + Send + 'static) -> bool {
        let Some(syms) = encode_lossy(key) else {
            return false;
        };
        let Some((node, off)) = descend_mut(&mut self.root, &syms) else {
            return false;
        };
        if off != node.suffix.len() {
            return false;
        }
        match node.entry.as_mut() {
            Some(entry) => {
                entry.destructor = Some(Box::new(f));
                true
            }
            None => false,
        }
    }

    /// Visit every entry depth-first in lexical key order.
    ///
    /// Returns the number of entries visited. The callback may break the
    /// traversal early via `ControlFlow::Break`; the aborting visit is
    /// included in the count.
    pub fn for_each<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&str, &V) -> ControlFlow<()>,
    {
        let mut visited = 0;
        let _ = walk(&self.root, &mut f, &mut visited);
        visited
    }

    /// Keep only the entries for which `f` returns true.
    ///
    /// This is the delete-during-traversal counterpart of `for_each`;
    /// discarded entries fire their destructors.
    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&str, &V) -> bool,
    {
        let mut doomed = Vec::new();
        self.for_each(|key, value| {
            if !f(key, value) {
                doomed.push(key.to_string());
            }
            ControlFlow::Continue(())
        });
        for key in doomed {
            self.remove(&key);
        }
    }
}

fn walk<V, F>(node: &Node<V>, f: &mut F, visited: &mut usize) -> ControlFlow<()>
where
    F: FnMut(&str, &V) -> ControlFlow<()>,
{
    if let Some(entry) = &node.entry {
        if let Some(value) = &entry.value {
            *visited += 1;
            f(&entry.key, value)?;
        }
    }
    if let Some(children) = &node.children {
        for child in children.iter().flatten() {
            walk(child, f, visited)?;
        }
    }
    ControlFlow::Continue(())
}

fn insert_at<V>(node: &mut Node<V>, syms: &[u8], at: usize, entry: Entry<V>) -> Insert {
    let common = common_prefix(&node.suffix, &syms[at..]);
    if common < node.suffix.len() {
        // Bifurcate: this node keeps the shared prefix, the remainder of
        // its old suffix (plus entry and children) moves into a child.
        let branch = node.suffix[common] as usize;
        let tail = node.suffix.split_off(common + 1);
        node.suffix.truncate(common);
        let moved = Node {
            children: node.children.take(),
            suffix: tail,
            entry: node.entry.take(),
        };
        let mut children = empty_children();
        children[branch] = Some(Box::new(moved));
        node.children = Some(children);
    }
    let at = at + common;
    if at == syms.len() {
        if node.entry.is_some() {
            return Insert::AlreadyPresent;
        }
        node.entry = Some(entry);
        return Insert::Inserted;
    }
    let b = syms[at] as usize;
    let children = node.children.get_or_insert_with(empty_children);
    match &mut children[b] {
        Some(child) => insert_at(child, syms, at + 1, entry),
        slot @ None => {
            *slot = Some(Box::new(Node {
                children: None,
                suffix: syms[at + 1..].to_vec(),
                entry: Some(entry),
            }));
            Insert::Inserted
        }
    }
}

fn remove_at<V>(node: &mut Node<V>, syms: &[u8], at: usize, is_root: bool) -> RemoveStep {
    let common = common_prefix(&node.suffix, &syms[at..]);
    if common < node.suffix.len() {
        // Key diverges inside, or ends inside, this node's edge.
        return RemoveStep::NotFound;
    }
    let at = at + common;
    if at == syms.len() {
        if node.entry.is_none() {
            return RemoveStep::NotFound;
        }
        node.entry = None;
    } else {
        let b = syms[at] as usize;
        let Some(children) = node.children.as_mut() else {
            return RemoveStep::NotFound;
        };
        let Some(child) = children[b].as_deref_mut() else {
            return RemoveStep::NotFound;
        };
        match remove_at(child, syms, at + 1, false) {
            RemoveStep::NotFound => return RemoveStep::NotFound,
            RemoveStep::Removed { drop_child } => {
                if drop_child {
                    children[b] = None;
                }
            }
        }
    }
    normalize(node, is_root)
}

/// Restore the trie invariant after a removal at or below `node`: a node
/// with a children array must hold an entry or at least one live child.
fn normalize<V>(node: &mut Node<V>, is_root: bool) -> RemoveStep {
    if is_root {
        // The root branch array is permanent.
        return RemoveStep::Removed { drop_child: false };
    }
    let live = node
        .children
        .as_ref()
        .map(|c| c.iter().filter(|s| s.is_some()).count())
        .unwrap_or(0);
    if live == 0 {
        node.children = None;
        if node.entry.is_none() {
            return RemoveStep::Removed { drop_child: true };
        }
        return RemoveStep::Removed { drop_child: false };
    }
    if live == 1 && node.entry.is_none() {
        // Absorb the single remaining child upward, concatenating its
        // symbol run onto ours.
        if let Some(children) = node.children.as_mut() {
            if let Some(branch) = children.iter().position(Option::is_some) {
                if let Some(child) = children[branch].take() {
                    let child = *child;
                    node.suffix.push(branch as u8);
                    node.suffix.extend(child.suffix);
                    node.entry = child.entry;
                    node.children = child.children;
                }
            }
        }
    }
    RemoveStep::Removed { drop_child: false }
}
