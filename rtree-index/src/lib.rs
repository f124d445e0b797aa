//! # rtree_index - Disk-Resident R-Tree Spatial Index
//!
//! A Guttman R-tree whose nodes live in fixed-size pages of a single file,
//! paired with an element mapper that stores the full record for every
//! indexed identifier.
//!
//! ## Features
//!
//! - **Disk-Based Storage**: Pages stored on disk, loaded on demand
//! - **LRU Cache**: Frequently accessed pages kept in memory
//! - **Pluggable Splits**: Linear and quadratic split strategies, or your own
//! - **Element Mappers**: Embedded fjall keyspace or a SQL table in one of three dialects
//! - **Lazy Search**: Cursors read one page at a time and can be dropped early
//! - **Tree Registry**: One shared tree per storage location, with owner tracking
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtree_index::{Bounds, ManagerConfig, NamedEnvelope, OwnerId, ReferenceSystem, TreeRegistry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = TreeRegistry::new(ManagerConfig::new());
//! let owner = OwnerId::from("roads-layer");
//! let tree = registry.get_or_open("/tmp/roads-index", &owner)?;
//!
//! let bounds = Bounds::new(vec![0.0, 0.0], vec![10.0, 10.0])?;
//! tree.insert(&NamedEnvelope::new("road-1", bounds, ReferenceSystem::default()))?;
//!
//! let query = Bounds::new(vec![5.0, 5.0], vec![15.0, 15.0])?;
//! for envelope in tree.search(&query)?.iter() {
//!     println!("{}", envelope?);
//! }
//!
//! registry.release("/tmp/roads-index", &owner)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`envelope`] - Bounding boxes and named envelopes
//! - [`disk_rtree`] - Paged node store, split strategies and the tree engine
//! - [`mapper`] - Element mapper trait and its backends
//! - [`tree_manager`] - Registry of open trees
//! - [`config`] - Tree and registry configuration
//! - [`errors`] - Error types and result definitions

pub mod config;
pub mod disk_rtree;
pub mod envelope;
pub mod errors;
pub mod mapper;
pub mod tree_manager;

pub use config::{ManagerConfig, TreeConfig};
pub use disk_rtree::{
    IntegrityReport, LinearSplit, QuadraticSplit, RTree, RTreeStats, Search, SearchIter,
    SplitKind, SplitStrategy,
};
pub use envelope::{Bounds, NamedEnvelope, ReferenceSystem};
pub use errors::{
    IndexError, IndexResult, ManagerError, ManagerResult, MapperError, MapperResult, OpenFailure,
    StorageError, StorageResult,
};
pub use mapper::{
    ElementMapper, FileElementMapper, MemoryElementMapper, SqlConnectionPool, SqlDatasource,
    SqlDialectKind, SqlElementMapper,
};
pub use tree_manager::{OwnerId, TreeRegistry};
