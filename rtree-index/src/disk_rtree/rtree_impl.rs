//! RTree implementation.
//!
//! Nodes live in a [`NodeStore`] and are read one page at a time; nothing
//! beyond the page cache is kept in memory. Full records live in the
//! [`ElementMapper`], which the tree consults for duplicate checks and to
//! locate the bounds of an identifier being removed.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::persistence::{self, IntegrityReport};
use super::rtree_constants::NULL_PAGE;
use super::rtree_search::{Search, SearchMode};
use super::rtree_storage::NodeStore;
use super::rtree_types::{ChildRef, LeafEntry, Node, PageId, RTreeStats};
use super::split::{SplitKind, SplitStrategy};
use crate::config::TreeConfig;
use crate::envelope::{Bounds, NamedEnvelope, ReferenceSystem};
use crate::errors::{IndexError, IndexResult, StorageError};
use crate::mapper::ElementMapper;

/// One node on a root-to-leaf path and the slot taken in it.
struct PathStep {
    page_id: PageId,
    node: Node,
    slot: usize,
}

/// A disk-resident R-Tree over named envelopes.
///
/// `RTree` is a cheap handle; clones share the same store and mapper.
/// Mutations are serialized internally. Searches read one node at a time and
/// may run alongside each other, but a cursor that is open while the tree is
/// modified can observe pages that were freed under it.
#[derive(Clone)]
pub struct RTree {
    inner: Arc<RTreeInner>,
}

struct RTreeInner {
    store: NodeStore,
    mapper: Arc<dyn ElementMapper>,
    strategy: Arc<dyn SplitStrategy>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl RTree {
    /// Create a new, empty tree at `path`, splitting with `config.split()`.
    ///
    /// Any file already at `path` is replaced and any records left in
    /// `mapper` are discarded.
    pub fn create(
        path: &Path,
        config: &TreeConfig,
        mapper: Arc<dyn ElementMapper>,
    ) -> IndexResult<Self> {
        Self::create_with_strategy(path, config, mapper, config.split().strategy())
    }

    /// Create a new, empty tree that splits with `strategy`.
    ///
    /// The strategy code is stored in the file; a tree created with a custom
    /// strategy must be reopened with [`RTree::open_with_strategy`].
    pub fn create_with_strategy(
        path: &Path,
        config: &TreeConfig,
        mapper: Arc<dyn ElementMapper>,
        strategy: Arc<dyn SplitStrategy>,
    ) -> IndexResult<Self> {
        let store = NodeStore::create(path, config, strategy.code())?;
        let root = store.allocate_page()?;
        store.write_node(root, &Node::empty_leaf())?;
        store.set_root(root, 1);
        store.flush()?;

        if !mapper.is_empty()? {
            log::warn!("Discarding stale element records for new tree at {:?}", path);
            mapper.clear()?;
        }

        log::debug!("Created R-Tree at {:?} with {} split", path, strategy.name());
        Self::from_store(store, mapper, strategy)
    }

    /// Open an existing tree with the split strategy recorded in its file.
    ///
    /// `expected` must match the stored dimensionality, page size and
    /// reference system; its cache size applies to this handle.
    pub fn open(
        path: &Path,
        expected: &TreeConfig,
        mapper: Arc<dyn ElementMapper>,
    ) -> IndexResult<Self> {
        let store = NodeStore::open(path, expected)?;
        let code = store.header().split_strategy;
        let kind = SplitKind::from_code(code).ok_or_else(|| {
            StorageError::IncompatibleFormat(format!("unknown split strategy code {}", code))
        })?;
        Self::from_store(store, mapper, kind.strategy())
    }

    /// Open an existing tree that was created with `strategy`.
    pub fn open_with_strategy(
        path: &Path,
        expected: &TreeConfig,
        mapper: Arc<dyn ElementMapper>,
        strategy: Arc<dyn SplitStrategy>,
    ) -> IndexResult<Self> {
        let store = NodeStore::open(path, expected)?;
        let code = store.header().split_strategy;
        if code != strategy.code() {
            return Err(StorageError::IncompatibleFormat(format!(
                "tree was created with split strategy code {}, {} has code {}",
                code,
                strategy.name(),
                strategy.code()
            ))
            .into());
        }
        Self::from_store(store, mapper, strategy)
    }

    fn from_store(
        store: NodeStore,
        mapper: Arc<dyn ElementMapper>,
        strategy: Arc<dyn SplitStrategy>,
    ) -> IndexResult<Self> {
        let header = store.header();
        if header.root_page == NULL_PAGE || header.height == 0 {
            let msg = format!("store at {:?} has no root page", store.path());
            log::error!("{}", msg);
            return Err(IndexError::CorruptTree(msg));
        }
        Ok(Self {
            inner: Arc::new(RTreeInner {
                store,
                mapper,
                strategy,
                write_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Effective configuration: stored format fields plus this handle's tuning.
    pub fn config(&self) -> &TreeConfig {
        self.inner.store.config()
    }

    pub fn reference_system(&self) -> &ReferenceSystem {
        self.config().reference_system()
    }

    pub fn path(&self) -> &Path {
        self.inner.store.path()
    }

    pub fn split_strategy(&self) -> &dyn SplitStrategy {
        self.inner.strategy.as_ref()
    }

    pub fn len(&self) -> u64 {
        self.inner.store.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels; a tree whose root is a leaf has height 1.
    pub fn height(&self) -> u32 {
        self.inner.store.height()
    }

    pub fn stats(&self) -> RTreeStats {
        self.inner.store.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same open tree.
    pub fn ptr_eq(&self, other: &RTree) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_opened(&self) -> IndexResult<()> {
        if self.is_closed() {
            return Err(IndexError::Closed);
        }
        Ok(())
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Index `envelope` and record it in the element mapper.
    ///
    /// Fails with [`IndexError::DuplicateIdentifier`] if the identifier is
    /// already indexed; remove it first to move it.
    pub fn insert(&self, envelope: &NamedEnvelope) -> IndexResult<()> {
        self.check_opened()?;
        self.validate_envelope(envelope)?;

        let _guard = self.inner.write_lock.lock();
        self.check_opened()?;
        if self.inner.mapper.contains(envelope.identifier())? {
            return Err(IndexError::DuplicateIdentifier(
                envelope.identifier().to_string(),
            ));
        }

        let entry = LeafEntry::from_envelope(envelope);
        self.insert_entry(entry)?;
        let store = &self.inner.store;
        store.set_entry_count(store.entry_count() + 1);

        if let Err(err) = self.inner.mapper.put(envelope) {
            log::warn!(
                "Element mapper rejected {}, removing it from the tree: {}",
                envelope.identifier(),
                err
            );
            if let Err(rollback) = self.delete_entry(envelope.bounds(), envelope.identifier()) {
                log::error!(
                    "Failed to roll back {} after a mapper failure: {}",
                    envelope.identifier(),
                    rollback
                );
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Every stored envelope whose bounds overlap `query`, boundaries included.
    ///
    /// The returned [`Search`] reads pages lazily and can be iterated any
    /// number of times.
    pub fn search<Q: AsRef<Bounds>>(&self, query: Q) -> IndexResult<Search> {
        self.new_search(query.as_ref(), SearchMode::Intersects)
    }

    /// Every stored envelope lying entirely inside `query`.
    pub fn search_within<Q: AsRef<Bounds>>(&self, query: Q) -> IndexResult<Search> {
        self.new_search(query.as_ref(), SearchMode::Within)
    }

    fn new_search(&self, query: &Bounds, mode: SearchMode) -> IndexResult<Search> {
        self.check_opened()?;
        self.check_dimensions(query.dimensions())?;
        Ok(Search::new(self.clone(), query.clone(), mode))
    }

    /// Remove `identifier`. Returns `false`, without touching the tree, if it
    /// is not indexed.
    pub fn remove(&self, identifier: &str) -> IndexResult<bool> {
        self.check_opened()?;
        let _guard = self.inner.write_lock.lock();
        self.check_opened()?;

        let Some(envelope) = self.inner.mapper.get(identifier)? else {
            return Ok(false);
        };
        let removed = self.delete_entry(envelope.bounds(), identifier)?;
        if !removed {
            log::warn!(
                "{} has an element record but no tree entry in {:?}; dropping the record",
                identifier,
                self.path()
            );
        }
        self.inner.mapper.remove(identifier)?;
        Ok(removed)
    }

    /// Drop every entry, leaving a single empty leaf as the root.
    pub fn clear(&self) -> IndexResult<()> {
        self.check_opened()?;
        let _guard = self.inner.write_lock.lock();
        self.check_opened()?;

        let store = &self.inner.store;
        store.reset()?;
        let root = store.allocate_page()?;
        store.write_node(root, &Node::empty_leaf())?;
        store.set_root(root, 1);
        self.inner.mapper.clear()?;
        store.flush()?;
        self.inner.mapper.flush()?;
        log::debug!("Cleared R-Tree at {:?}", self.path());
        Ok(())
    }

    /// The record stored for `identifier`.
    pub fn get(&self, identifier: &str) -> IndexResult<Option<NamedEnvelope>> {
        self.check_opened()?;
        Ok(self.inner.mapper.get(identifier)?)
    }

    pub fn contains(&self, identifier: &str) -> IndexResult<bool> {
        self.check_opened()?;
        Ok(self.inner.mapper.contains(identifier)?)
    }

    /// Write every buffered page and make mapper writes durable.
    pub fn flush(&self) -> IndexResult<()> {
        self.check_opened()?;
        let _guard = self.inner.write_lock.lock();
        self.inner.store.flush()?;
        self.inner.mapper.flush()?;
        Ok(())
    }

    /// Flush and release the store and the mapper. Calling it again is a no-op.
    pub fn close(&self) -> IndexResult<()> {
        let _guard = self.inner.write_lock.lock();
        if self.is_closed() {
            return Ok(());
        }
        let store_result = self.inner.store.close();
        let mapper_result = self.inner.mapper.close();
        self.inner.closed.store(true, Ordering::Release);
        store_result?;
        mapper_result?;
        log::debug!("Closed R-Tree at {:?}", self.path());
        Ok(())
    }

    /// Walk every page and report structural problems. Read-only.
    pub fn check_integrity(&self) -> IndexResult<IntegrityReport> {
        self.check_opened()?;
        let _guard = self.inner.write_lock.lock();
        Ok(persistence::check_integrity(&self.inner.store)?)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn check_dimensions(&self, actual: usize) -> IndexResult<()> {
        let expected = self.config().dimensions();
        if actual != expected {
            return Err(IndexError::DimensionMismatch { expected, actual });
        }
        Ok(())
    }

    fn validate_envelope(&self, envelope: &NamedEnvelope) -> IndexResult<()> {
        self.check_dimensions(envelope.dimensions())?;
        if envelope.reference_system() != self.reference_system() {
            return Err(IndexError::ReferenceSystemMismatch {
                expected: self.reference_system().to_string(),
                actual: envelope.reference_system().to_string(),
            });
        }
        let id_len = envelope.identifier().len();
        if id_len == 0 {
            return Err(IndexError::InvalidEnvelope("identifier is empty".into()));
        }
        if id_len > self.config().max_identifier_len() {
            return Err(IndexError::InvalidEnvelope(format!(
                "identifier of {} bytes exceeds the limit of {}",
                id_len,
                self.config().max_identifier_len()
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Node access
    // ========================================================================

    /// Root page and its level.
    pub(crate) fn root(&self) -> (PageId, u32) {
        let header = self.inner.store.header();
        (header.root_page, header.height.saturating_sub(1))
    }

    /// Read a node that the caller expects at `level`.
    ///
    /// Levels strictly decrease on the way down, so the check also rules out
    /// reference cycles.
    pub(crate) fn read_node_at(&self, page_id: PageId, level: u32) -> IndexResult<Node> {
        let node = match self.inner.store.read_node(page_id) {
            Ok(node) => node,
            Err(StorageError::Corrupt(msg)) => return Err(self.corrupt(msg)),
            Err(err) => return Err(err.into()),
        };
        if node.level() != level {
            return Err(self.corrupt(format!(
                "page {} is at level {}, expected {}",
                page_id,
                node.level(),
                level
            )));
        }
        Ok(node)
    }

    fn corrupt(&self, msg: String) -> IndexError {
        log::error!("Corrupt R-Tree at {:?}: {}", self.path(), msg);
        IndexError::CorruptTree(msg)
    }

    // ========================================================================
    // Insertion
    // ========================================================================

    fn insert_entry(&self, entry: LeafEntry) -> IndexResult<()> {
        let mut path = self.choose_leaf(&entry.bounds)?;
        let Some(leaf) = path.pop() else {
            return Err(self.corrupt("insertion path is empty".into()));
        };
        let node = match leaf.node {
            Node::Leaf { mut entries } => {
                entries.push(entry);
                Node::Leaf { entries }
            }
            Node::Branch { .. } => {
                return Err(self.corrupt(format!("page {} is not a leaf", leaf.page_id)))
            }
        };
        let (bounds, split) = self.store_or_split(leaf.page_id, node)?;
        self.adjust_tree(path, bounds, split)
    }

    /// Descend from the root to the leaf that should receive `bounds`.
    fn choose_leaf(&self, bounds: &Bounds) -> IndexResult<Vec<PathStep>> {
        let (mut page_id, mut level) = self.root();
        let mut path = Vec::with_capacity(level as usize + 1);
        loop {
            let node = self.read_node_at(page_id, level)?;
            let next = match &node {
                Node::Leaf { .. } => None,
                Node::Branch { children, .. } => {
                    let slot = self.choose_subtree(page_id, children, bounds, level - 1)?;
                    Some((slot, children[slot].page_id))
                }
            };
            match next {
                None => {
                    path.push(PathStep {
                        page_id,
                        node,
                        slot: 0,
                    });
                    return Ok(path);
                }
                Some((slot, child)) => {
                    path.push(PathStep {
                        page_id,
                        node,
                        slot,
                    });
                    page_id = child;
                    level -= 1;
                }
            }
        }
    }

    /// Least area enlargement, then smallest resulting area, then fewest entries.
    fn choose_subtree(
        &self,
        page_id: PageId,
        children: &[ChildRef],
        bounds: &Bounds,
        child_level: u32,
    ) -> IndexResult<usize> {
        if children.is_empty() {
            return Err(self.corrupt(format!("branch page {} has no children", page_id)));
        }

        let costs: Vec<(f64, f64)> = children
            .iter()
            .map(|child| {
                let merged = child.bounds.merge(bounds);
                (merged.area() - child.bounds.area(), merged.area())
            })
            .collect();

        let mut tied = vec![0];
        for (i, cost) in costs.iter().enumerate().skip(1) {
            match cost.partial_cmp(&costs[tied[0]]) {
                Some(std::cmp::Ordering::Less) => tied = vec![i],
                Some(std::cmp::Ordering::Equal) => tied.push(i),
                _ => {}
            }
        }
        if tied.len() == 1 {
            return Ok(tied[0]);
        }

        let mut best = tied[0];
        let mut fewest = usize::MAX;
        for i in tied {
            let len = self.read_node_at(children[i].page_id, child_level)?.len();
            if len < fewest {
                fewest = len;
                best = i;
            }
        }
        Ok(best)
    }

    /// Write `node` to `page_id`, splitting it first if it overflows.
    ///
    /// Returns the bounds of the node kept at `page_id` and, after a split,
    /// a reference to the new sibling.
    fn store_or_split(&self, page_id: PageId, node: Node) -> IndexResult<(Bounds, Option<ChildRef>)> {
        let store = &self.inner.store;
        let config = store.config();
        let dims = config.dimensions();

        if node.len() <= config.fanout() {
            store.write_node(page_id, &node)?;
            return Ok((node.compute_bounds(dims), None));
        }

        let boxes = node.entry_bounds();
        let (left, right) = self.inner.strategy.split(&boxes, config.min_fill());
        self.check_split(boxes.len(), &left, &right)?;

        let level = node.level();
        let (first, second) = node.partition(&left, &right);
        let sibling = store.allocate_page()?;
        store.write_node(page_id, &first)?;
        store.write_node(sibling, &second)?;
        log::debug!(
            "Split page {} at level {} into {} + {} (sibling page {})",
            page_id,
            level,
            first.len(),
            second.len(),
            sibling
        );

        Ok((
            first.compute_bounds(dims),
            Some(ChildRef {
                bounds: second.compute_bounds(dims),
                page_id: sibling,
            }),
        ))
    }

    fn check_split(&self, n: usize, left: &[usize], right: &[usize]) -> IndexResult<()> {
        let config = self.config();
        let invalid = |reason: String| IndexError::InvalidSplit {
            strategy: self.inner.strategy.name().to_string(),
            reason,
        };

        for group in [left, right] {
            if group.len() < config.min_fill() || group.len() > config.fanout() {
                return Err(invalid(format!(
                    "group of {} entries, allowed {}..={}",
                    group.len(),
                    config.min_fill(),
                    config.fanout()
                )));
            }
        }
        let mut seen = vec![false; n];
        for &i in left.iter().chain(right) {
            match seen.get_mut(i) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => return Err(invalid(format!("entry {} assigned twice", i))),
                None => return Err(invalid(format!("entry {} out of range 0..{}", i, n))),
            }
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(invalid(format!("entry {} not assigned", missing)));
        }
        Ok(())
    }

    /// Propagate a changed child box, and possibly a new sibling, towards the root.
    fn adjust_tree(
        &self,
        mut path: Vec<PathStep>,
        mut bounds: Bounds,
        mut split: Option<ChildRef>,
    ) -> IndexResult<()> {
        while let Some(step) = path.pop() {
            let Node::Branch { mut children, level } = step.node else {
                return Err(self.corrupt(format!(
                    "page {} on an insertion path is not a branch",
                    step.page_id
                )));
            };
            if split.is_none() && children[step.slot].bounds == bounds {
                return Ok(());
            }
            children[step.slot].bounds = bounds;
            children.extend(split.take());

            let (node_bounds, node_split) =
                self.store_or_split(step.page_id, Node::Branch { children, level })?;
            bounds = node_bounds;
            split = node_split;
        }

        if let Some(sibling) = split {
            self.grow_root(bounds, sibling)?;
        }
        Ok(())
    }

    fn grow_root(&self, bounds: Bounds, sibling: ChildRef) -> IndexResult<()> {
        let store = &self.inner.store;
        let (old_root, height) = (store.root_page(), store.height());
        let new_root = store.allocate_page()?;
        let node = Node::Branch {
            children: vec![
                ChildRef {
                    bounds,
                    page_id: old_root,
                },
                sibling,
            ],
            level: height,
        };
        store.write_node(new_root, &node)?;
        store.set_root(new_root, height + 1);
        log::debug!("Root split; tree height is now {}", height + 1);
        Ok(())
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Remove the leaf entry for `identifier`, located through `bounds`.
    fn delete_entry(&self, bounds: &Bounds, identifier: &str) -> IndexResult<bool> {
        let (root, level) = self.root();
        let mut path = Vec::with_capacity(level as usize + 1);
        if !self.find_leaf(root, level, bounds, identifier, &mut path)? {
            return Ok(false);
        }
        self.condense_tree(path)?;
        let store = &self.inner.store;
        store.set_entry_count(store.entry_count().saturating_sub(1));
        Ok(true)
    }

    fn find_leaf(
        &self,
        page_id: PageId,
        level: u32,
        bounds: &Bounds,
        identifier: &str,
        path: &mut Vec<PathStep>,
    ) -> IndexResult<bool> {
        let node = self.read_node_at(page_id, level)?;
        let candidates: Vec<(usize, PageId)> = match &node {
            Node::Leaf { entries } => entries
                .iter()
                .position(|e| e.identifier == identifier)
                .into_iter()
                .map(|slot| (slot, page_id))
                .collect(),
            Node::Branch { children, .. } => children
                .iter()
                .enumerate()
                .filter(|(_, child)| child.bounds.contains(bounds))
                .map(|(slot, child)| (slot, child.page_id))
                .collect(),
        };

        if node.is_leaf() {
            let Some(&(slot, _)) = candidates.first() else {
                return Ok(false);
            };
            path.push(PathStep {
                page_id,
                node,
                slot,
            });
            return Ok(true);
        }

        path.push(PathStep {
            page_id,
            node,
            slot: 0,
        });
        for (slot, child) in candidates {
            if let Some(step) = path.last_mut() {
                step.slot = slot;
            }
            if self.find_leaf(child, level - 1, bounds, identifier, path)? {
                return Ok(true);
            }
        }
        path.pop();
        Ok(false)
    }

    /// Remove the entry at the end of `path`, detach every node left underfull
    /// on the way up and reinsert the leaf entries beneath them.
    fn condense_tree(&self, mut path: Vec<PathStep>) -> IndexResult<()> {
        let store = &self.inner.store;
        let dims = store.config().dimensions();
        let min_fill = store.config().min_fill();

        let Some(leaf) = path.pop() else {
            return Err(self.corrupt("deletion path is empty".into()));
        };
        let mut page_id = leaf.page_id;
        let mut node = match leaf.node {
            Node::Leaf { mut entries } => {
                entries.remove(leaf.slot);
                Node::Leaf { entries }
            }
            Node::Branch { .. } => {
                return Err(self.corrupt(format!("page {} is not a leaf", leaf.page_id)))
            }
        };

        let mut orphans = Vec::new();
        while let Some(parent) = path.pop() {
            let Node::Branch {
                mut children,
                level,
            } = parent.node
            else {
                return Err(self.corrupt(format!(
                    "page {} on a deletion path is not a branch",
                    parent.page_id
                )));
            };
            if node.len() < min_fill {
                children.remove(parent.slot);
                self.detach(page_id, node, &mut orphans)?;
            } else {
                children[parent.slot].bounds = node.compute_bounds(dims);
                store.write_node(page_id, &node)?;
            }
            node = Node::Branch { children, level };
            page_id = parent.page_id;
        }
        store.write_node(page_id, &node)?;
        self.collapse_root()?;

        if !orphans.is_empty() {
            log::debug!("Reinserting {} entries from underfull nodes", orphans.len());
        }
        for entry in orphans {
            self.insert_entry(entry)?;
        }
        Ok(())
    }

    /// Free `page_id` and every page beneath it, collecting their leaf entries.
    fn detach(&self, page_id: PageId, node: Node, orphans: &mut Vec<LeafEntry>) -> IndexResult<()> {
        match node {
            Node::Leaf { entries } => orphans.extend(entries),
            Node::Branch { children, level } => {
                for child in children {
                    let child_node = self.read_node_at(child.page_id, level - 1)?;
                    self.detach(child.page_id, child_node, orphans)?;
                }
            }
        }
        self.inner.store.free_page(page_id)?;
        Ok(())
    }

    /// Replace a branch root that has a single child by that child.
    fn collapse_root(&self) -> IndexResult<()> {
        let store = &self.inner.store;
        loop {
            let (root, level) = self.root();
            match self.read_node_at(root, level)? {
                Node::Branch { children, .. } if children.len() == 1 => {
                    store.set_root(children[0].page_id, level);
                    store.free_page(root)?;
                    log::debug!("Collapsed root; tree height is now {}", level);
                }
                _ => return Ok(()),
            }
        }
    }
}

impl Drop for RTreeInner {
    fn drop(&mut self) {
        // Best effort flush on drop
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.store.flush() {
            log::warn!("Failed to flush R-Tree at {:?} on drop: {}", self.store.path(), err);
        }
        if let Err(err) = self.mapper.flush() {
            log::warn!("Failed to flush element mapper on drop: {}", err);
        }
    }
}
