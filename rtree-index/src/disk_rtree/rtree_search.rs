//! Lazy search cursors over an [`RTree`].

use std::iter::FusedIterator;

use super::rtree_constants::NULL_PAGE;
use super::rtree_impl::RTree;
use super::rtree_types::{LeafEntry, Node, PageId};
use crate::envelope::{Bounds, NamedEnvelope};
use crate::errors::{IndexError, IndexResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchMode {
    Intersects,
    Within,
}

/// A spatial query bound to a tree.
///
/// Nothing is read until the query is iterated. Every call to [`Search::iter`]
/// starts a fresh traversal from the current root, so a `Search` can be
/// consumed any number of times.
#[derive(Clone)]
pub struct Search {
    tree: RTree,
    query: Bounds,
    mode: SearchMode,
}

impl Search {
    pub(crate) fn new(tree: RTree, query: Bounds, mode: SearchMode) -> Self {
        Self { tree, query, mode }
    }

    pub fn query(&self) -> &Bounds {
        &self.query
    }

    /// Whether only entries lying entirely inside the query are returned.
    pub fn is_within(&self) -> bool {
        self.mode == SearchMode::Within
    }

    pub fn iter(&self) -> SearchIter {
        let (root, level) = self.tree.root();
        let stack = if root == NULL_PAGE {
            Vec::new()
        } else {
            vec![(root, level)]
        };
        SearchIter {
            tree: self.tree.clone(),
            query: self.query.clone(),
            mode: self.mode,
            stack,
            pending: Vec::new(),
            finished: false,
        }
    }

    /// Drain one traversal into a vector, stopping at the first error.
    pub fn to_vec(&self) -> IndexResult<Vec<NamedEnvelope>> {
        self.iter().collect()
    }
}

impl IntoIterator for Search {
    type Item = IndexResult<NamedEnvelope>;
    type IntoIter = SearchIter;

    fn into_iter(self) -> SearchIter {
        self.iter()
    }
}

impl IntoIterator for &Search {
    type Item = IndexResult<NamedEnvelope>;
    type IntoIter = SearchIter;

    fn into_iter(self) -> SearchIter {
        self.iter()
    }
}

/// Depth-first traversal that reads one page per step.
///
/// Holds no file handles or page locks between calls to `next`, so it may be
/// dropped at any point. After yielding an error it yields nothing more.
pub struct SearchIter {
    tree: RTree,
    query: Bounds,
    mode: SearchMode,
    stack: Vec<(PageId, u32)>,
    pending: Vec<LeafEntry>,
    finished: bool,
}

impl SearchIter {
    fn matches(&self, entry: &LeafEntry) -> bool {
        match self.mode {
            SearchMode::Intersects => self.query.intersects(&entry.bounds),
            SearchMode::Within => self.query.contains(&entry.bounds),
        }
    }

    fn fail(&mut self, err: IndexError) -> Option<IndexResult<NamedEnvelope>> {
        self.finished = true;
        self.stack.clear();
        self.pending.clear();
        Some(Err(err))
    }
}

impl Iterator for SearchIter {
    type Item = IndexResult<NamedEnvelope>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(entry) = self.pending.pop() {
                return Some(Ok(entry.to_envelope(self.tree.reference_system())));
            }
            let Some((page_id, level)) = self.stack.pop() else {
                self.finished = true;
                return None;
            };
            if self.tree.is_closed() {
                return self.fail(IndexError::Closed);
            }

            match self.tree.read_node_at(page_id, level) {
                Err(err) => return self.fail(err),
                Ok(Node::Leaf { entries }) => {
                    let mut hits: Vec<LeafEntry> =
                        entries.into_iter().filter(|e| self.matches(e)).collect();
                    hits.reverse();
                    self.pending = hits;
                }
                Ok(Node::Branch { children, .. }) => {
                    for child in children.into_iter().rev() {
                        if child.bounds.intersects(&self.query) {
                            self.stack.push((child.page_id, level - 1));
                        }
                    }
                }
            }
        }
    }
}

impl FusedIterator for SearchIter {}
