//! Incremental lookup cursor over a [`Dict`](super::Dict) subtree.

use super::{descend, encode, Node};

/// A position inside a dictionary, obtained from
/// [`Dict::subtree`](super::Dict::subtree).
///
/// The cursor remembers where a previous partial lookup stopped — possibly
/// in the middle of a compressed edge — so hierarchical names can be
/// resolved segment by segment:
///
/// ```
/// use quickstream_core::Dict;
///
/// let mut dict = Dict::new();
/// dict.insert("pool:worker:count", 3).unwrap();
/// let cursor = dict.subtree("pool:").unwrap();
/// assert_eq!(cursor.find("worker:count"), Some(&3));
/// ```
///
/// The borrow rules keep cursors honest: holding one borrows the
/// dictionary shared, so no insert or remove can invalidate it.
#[derive(Clone, Copy)]
pub struct DictCursor<'a, V> {
    node: &'a Node<V>,
    offset: usize,
}

impl<'a, V> DictCursor<'a, V> {
    pub(super) fn new(node: &'a Node<V>, offset: usize) -> Self {
        Self { node, offset }
    }

    /// The value stored exactly at the cursor position, if any.
    pub fn value(&self) -> Option<&'a V> {
        if self.offset == self.node.suffix_len() {
            self.node.entry().and_then(|e| e.value())
        } else {
            None
        }
    }

    /// Look up `key` relative to the cursor position.
    pub fn find(&self, key: &str) -> Option<&'a V> {
        self.subtree(key)?.value()
    }

    /// Advance the cursor by `key`, returning the deeper cursor.
    pub fn subtree(&self, key: &str) -> Option<DictCursor<'a, V>> {
        let syms = encode(key).ok()?;
        let (node, offset) = descend(self.node, self.offset, &syms)?;
        Some(DictCursor::new(node, offset))
    }
}
