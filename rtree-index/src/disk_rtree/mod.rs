//! Disk-based R-Tree.
//!
//! Nodes are stored one per fixed-size page and read on demand:
//! - Page-based node storage with a checksummed frame per page
//! - LRU write-back cache for hot pages
//! - Free list for pages released by deletions
//! - Pluggable split strategies chosen when a tree is created
//!
//! Only the header and the cached pages are ever held in memory.

pub mod persistence;
pub mod rtree_cache;
pub mod rtree_constants;
mod rtree_impl;
mod rtree_search;
pub mod rtree_storage;
pub mod rtree_types;
pub mod split;

pub use persistence::{check_integrity, FreeListManager, IntegrityReport};
pub use rtree_constants::{DEFAULT_CACHE_PAGES, DEFAULT_FANOUT, DEFAULT_PAGE_SIZE, TREE_FILE_NAME};
pub use rtree_impl::RTree;
pub use rtree_search::{Search, SearchIter};
pub use rtree_storage::NodeStore;
pub use rtree_types::{
    ChildRef, FileHeader, FreePage, LeafEntry, Node, PageId, PageWithChecksum, RTreeStats,
};
pub use split::{LinearSplit, QuadraticSplit, SplitKind, SplitStrategy};
