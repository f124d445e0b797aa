//! Configuration for trees and for the tree registry.
//!
//! [`TreeConfig`] is a plain value describing the shape of a single tree; the
//! fields that define the file format are persisted in the store header.
//! [`ManagerConfig`] is a cloneable, shared handle holding registry-wide settings.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::disk_rtree::rtree_constants::{
    DEFAULT_CACHE_PAGES, DEFAULT_DIMENSIONS, DEFAULT_FANOUT, DEFAULT_MAX_IDENTIFIER_LEN,
    DEFAULT_MIN_FILL, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MAX_REFERENCE_SYSTEM_LEN, MIN_FANOUT,
    MIN_PAGE_SIZE, PAGE_OVERHEAD,
};
use crate::disk_rtree::split::SplitKind;
use crate::envelope::{ReferenceSystem, MAX_DIMENSIONS};
use crate::errors::{StorageError, StorageResult};
use crate::mapper::SqlDatasource;

/// Shape and tuning of a single tree.
///
/// # Example
///
/// ```rust
/// use rtree_index::{SplitKind, TreeConfig};
///
/// let config = TreeConfig::new()
///     .with_dimensions(3)
///     .with_fanout(16)
///     .with_min_fill(6)
///     .with_split(SplitKind::Linear);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    dimensions: usize,
    page_size: usize,
    fanout: usize,
    min_fill: usize,
    split: SplitKind,
    max_identifier_len: usize,
    cache_pages: usize,
    reference_system: ReferenceSystem,
}

impl TreeConfig {
    /// Defaults: 2 dimensions, 16KB pages, M = 64, m = 25, quadratic split,
    /// 128-byte identifiers, 256 cached pages, EPSG:4326.
    pub fn new() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            page_size: DEFAULT_PAGE_SIZE,
            fanout: DEFAULT_FANOUT,
            min_fill: DEFAULT_MIN_FILL,
            split: SplitKind::default(),
            max_identifier_len: DEFAULT_MAX_IDENTIFIER_LEN,
            cache_pages: DEFAULT_CACHE_PAGES,
            reference_system: ReferenceSystem::default(),
        }
    }

    #[inline]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Maximum entries per node (M).
    #[inline]
    pub fn fanout(&self) -> usize {
        self.fanout
    }

    /// Minimum entries per non-root node (m).
    #[inline]
    pub fn min_fill(&self) -> usize {
        self.min_fill
    }

    #[inline]
    pub fn split(&self) -> SplitKind {
        self.split
    }

    #[inline]
    pub fn max_identifier_len(&self) -> usize {
        self.max_identifier_len
    }

    #[inline]
    pub fn cache_pages(&self) -> usize {
        self.cache_pages
    }

    #[inline]
    pub fn reference_system(&self) -> &ReferenceSystem {
        &self.reference_system
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn with_min_fill(mut self, min_fill: usize) -> Self {
        self.min_fill = min_fill;
        self
    }

    pub fn with_split(mut self, split: SplitKind) -> Self {
        self.split = split;
        self
    }

    pub fn with_max_identifier_len(mut self, len: usize) -> Self {
        self.max_identifier_len = len;
        self
    }

    pub fn with_cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    pub fn with_reference_system(mut self, reference_system: ReferenceSystem) -> Self {
        self.reference_system = reference_system;
        self
    }

    /// Encoded size of one leaf entry whose identifier uses the full budget.
    pub(crate) fn leaf_entry_size(&self) -> usize {
        2 * (8 + 8 * self.dimensions) + (8 + self.max_identifier_len) + 4
    }

    /// Encoded size of one branch child reference.
    pub(crate) fn child_entry_size(&self) -> usize {
        2 * (8 + 8 * self.dimensions) + 8
    }

    /// Bytes needed to store a completely full node.
    pub fn required_page_size(&self) -> usize {
        PAGE_OVERHEAD + self.fanout * self.leaf_entry_size().max(self.child_entry_size())
    }

    /// This configuration with `fanout` entries per node, adjusting the
    /// minimum fill and page size to stay consistent with it.
    fn resized_for_fanout(self, fanout: usize) -> Self {
        let min_fill = if (1..=fanout / 2).contains(&self.min_fill) {
            self.min_fill
        } else {
            (fanout * self.min_fill / self.fanout.max(1)).min(fanout / 2).max(1)
        };
        let mut resized = self.with_fanout(fanout).with_min_fill(min_fill);
        let required = resized.required_page_size();
        if required > resized.page_size {
            resized.page_size = required.next_power_of_two().min(MAX_PAGE_SIZE);
        }
        resized
    }

    /// Checks that the configuration describes a usable store.
    pub fn validate(&self) -> StorageResult<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} outside {}..={}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.dimensions == 0 || self.dimensions > MAX_DIMENSIONS {
            return Err(StorageError::InvalidConfig(format!(
                "dimensionality {} outside 1..={}",
                self.dimensions, MAX_DIMENSIONS
            )));
        }
        if self.fanout < MIN_FANOUT || self.fanout > u16::MAX as usize {
            return Err(StorageError::InvalidConfig(format!(
                "fanout {} outside {}..={}",
                self.fanout,
                MIN_FANOUT,
                u16::MAX
            )));
        }
        if self.min_fill < 1 || self.min_fill > self.fanout / 2 {
            return Err(StorageError::InvalidConfig(format!(
                "min fill {} outside 1..={}",
                self.min_fill,
                self.fanout / 2
            )));
        }
        if self.max_identifier_len == 0 || self.max_identifier_len > u16::MAX as usize {
            return Err(StorageError::InvalidConfig(format!(
                "identifier length budget {} outside 1..={}",
                self.max_identifier_len,
                u16::MAX
            )));
        }
        let code_len = self.reference_system.code().len();
        if code_len == 0 || code_len > MAX_REFERENCE_SYSTEM_LEN {
            return Err(StorageError::InvalidConfig(format!(
                "reference system code of {} bytes outside 1..={}",
                code_len, MAX_REFERENCE_SYSTEM_LEN
            )));
        }
        let required = self.required_page_size();
        if required > self.page_size {
            return Err(StorageError::InvalidConfig(format!(
                "a full node needs {} bytes but pages hold {}",
                required, self.page_size
            )));
        }
        Ok(())
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry-wide configuration.
///
/// A cloneable, thread-safe holder; clones share state, so a change made
/// through one handle is seen by the registry that holds another.
#[derive(Clone)]
pub struct ManagerConfig {
    inner: Arc<ManagerConfigInner>,
}

struct ManagerConfigInner {
    /// SQL backend for element mappers; the embedded backend is used when unset.
    datasource: RwLock<Option<SqlDatasource>>,

    /// Configuration applied to trees opened without an explicit one.
    tree_defaults: RwLock<TreeConfig>,
}

impl ManagerConfig {
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerConfigInner {
                datasource: RwLock::new(None),
                tree_defaults: RwLock::new(TreeConfig::new()),
            }),
        }
    }

    #[inline]
    pub fn datasource(&self) -> Option<SqlDatasource> {
        self.inner.datasource.read().clone()
    }

    #[inline]
    pub fn set_datasource(&self, datasource: Option<SqlDatasource>) {
        *self.inner.datasource.write() = datasource;
    }

    /// Builder-style method for chaining.
    #[inline]
    pub fn with_datasource(self, datasource: SqlDatasource) -> Self {
        self.set_datasource(Some(datasource));
        self
    }

    #[inline]
    pub fn tree_defaults(&self) -> TreeConfig {
        self.inner.tree_defaults.read().clone()
    }

    #[inline]
    pub fn set_tree_defaults(&self, config: TreeConfig) {
        *self.inner.tree_defaults.write() = config;
    }

    /// Builder-style method for chaining.
    #[inline]
    pub fn with_tree_defaults(self, config: TreeConfig) -> Self {
        self.set_tree_defaults(config);
        self
    }

    /// Fanout used when creating new trees.
    #[inline]
    pub fn default_fanout(&self) -> usize {
        self.inner.tree_defaults.read().fanout()
    }

    /// Changes the fanout of new trees.
    ///
    /// The default minimum fill is kept when it still fits the new fanout and
    /// rescaled to the same share of it otherwise. The default page size grows
    /// to the next power of two that holds a full node. A fanout no page can
    /// hold is rejected and leaves the defaults untouched.
    pub fn set_default_fanout(&self, fanout: usize) -> StorageResult<()> {
        let mut defaults = self.inner.tree_defaults.write();
        let resized = defaults.clone().resized_for_fanout(fanout);
        resized.validate()?;
        *defaults = resized;
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}
