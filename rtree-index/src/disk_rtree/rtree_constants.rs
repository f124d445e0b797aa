//! Constants for the paged R-Tree file format.

/// Default page size (16KB)
pub const DEFAULT_PAGE_SIZE: usize = 16384;

/// Smallest page size a store accepts
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size a store accepts (1MB)
pub const MAX_PAGE_SIZE: usize = 1 << 20;

/// Default maximum number of entries per node (M)
pub const DEFAULT_FANOUT: usize = 64;

/// Default minimum number of entries per non-root node (m)
pub const DEFAULT_MIN_FILL: usize = 25;

/// Smallest fanout a store accepts
pub const MIN_FANOUT: usize = 4;

/// Default dimensionality of new trees
pub const DEFAULT_DIMENSIONS: usize = 2;

/// Default identifier length budget, in bytes, reserved per leaf entry
pub const DEFAULT_MAX_IDENTIFIER_LEN: usize = 128;

/// Default cache size in pages (4MB with 16KB pages)
pub const DEFAULT_CACHE_PAGES: usize = 256;

/// Longest reference system code a store header records, in bytes
pub const MAX_REFERENCE_SYSTEM_LEN: usize = 256;

/// Magic number for file format identification
pub const MAGIC: u32 = 0x5254_5258; // "RTRX"

/// File format version
pub const VERSION: u16 = 1;

/// Marker stored at the start of a page on the free list
pub const FREE_PAGE_MARKER: u32 = 0x4652_4545; // "FREE"

/// Sentinel for "no page"; page 0 always holds the header
pub const NULL_PAGE: u64 = 0;

/// Name of the node store file inside a tree location
pub const TREE_FILE_NAME: &str = "tree.rtree";

/// Name of the embedded element mapper directory inside a tree location
pub const ELEMENTS_DIR_NAME: &str = "elements";

/// Fixed bincode overhead of an encoded page: checksum, body length,
/// node variant tag, entry count and branch level.
pub(crate) const PAGE_OVERHEAD: usize = 4 + 8 + 4 + 8 + 4;
