//! On-disk data structures of the paged R-Tree.
//!
//! This module defines:
//! - Node types (Leaf and Branch) and their entries
//! - The checksummed page frame and the free page record
//! - The file header stored in page 0
//! - Statistics structures

use serde::{Deserialize, Serialize};

use super::rtree_constants::{FREE_PAGE_MARKER, MAGIC, NULL_PAGE, VERSION};
use crate::config::TreeConfig;
use crate::disk_rtree::split::SplitKind;
use crate::envelope::{Bounds, NamedEnvelope, ReferenceSystem};
use crate::errors::{StorageError, StorageResult};

/// Page identifier; the byte offset of a page is `page_id * page_size`.
pub type PageId = u64;

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of tree and page store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RTreeStats {
    pub total_entries: u64,
    pub tree_height: u32,
    pub page_count: u64,
    pub free_pages: u64,
    pub cached_pages: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
}

// ============================================================================
// Node Types
// ============================================================================

/// Leaf entry: the bounds of one indexed element and its identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub bounds: Bounds,
    pub identifier: String,
    pub duplicate_count: u32,
}

impl LeafEntry {
    pub fn from_envelope(envelope: &NamedEnvelope) -> Self {
        Self {
            bounds: envelope.bounds().clone(),
            identifier: envelope.identifier().to_string(),
            duplicate_count: envelope.duplicate_count(),
        }
    }

    pub fn to_envelope(&self, reference_system: &ReferenceSystem) -> NamedEnvelope {
        NamedEnvelope::new(
            self.identifier.clone(),
            self.bounds.clone(),
            reference_system.clone(),
        )
        .with_duplicate_count(self.duplicate_count)
    }
}

/// Reference from a branch to one of its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    pub bounds: Bounds,
    pub page_id: PageId,
}

/// A tree node. Leaves sit at level 0; a branch at level `k` has children at level `k - 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf { entries: Vec<LeafEntry> },
    Branch { children: Vec<ChildRef>, level: u32 },
}

impl Node {
    pub fn empty_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
        }
    }

    /// Tight bounds over every entry, or the empty box for an empty node.
    pub fn compute_bounds(&self, dimensions: usize) -> Bounds {
        match self {
            Node::Leaf { entries } => Bounds::union_of(dimensions, entries.iter().map(|e| &e.bounds)),
            Node::Branch { children, .. } => {
                Bounds::union_of(dimensions, children.iter().map(|c| &c.bounds))
            }
        }
    }

    /// Bounds of every entry, in entry order.
    pub fn entry_bounds(&self) -> Vec<Bounds> {
        match self {
            Node::Leaf { entries } => entries.iter().map(|e| e.bounds.clone()).collect(),
            Node::Branch { children, .. } => children.iter().map(|c| c.bounds.clone()).collect(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn level(&self) -> u32 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Branch { level, .. } => *level,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Branch { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits the node into two of the same kind and level, keeping the
    /// entries named by `left` and `right` in that order.
    pub fn partition(self, left: &[usize], right: &[usize]) -> (Node, Node) {
        match self {
            Node::Leaf { entries } => {
                let pick = |indices: &[usize]| -> Vec<LeafEntry> {
                    indices.iter().map(|&i| entries[i].clone()).collect()
                };
                (
                    Node::Leaf {
                        entries: pick(left),
                    },
                    Node::Leaf {
                        entries: pick(right),
                    },
                )
            }
            Node::Branch { children, level } => {
                let pick = |indices: &[usize]| -> Vec<ChildRef> {
                    indices.iter().map(|&i| children[i].clone()).collect()
                };
                (
                    Node::Branch {
                        children: pick(left),
                        level,
                    },
                    Node::Branch {
                        children: pick(right),
                        level,
                    },
                )
            }
        }
    }
}

// ============================================================================
// Page Frames
// ============================================================================

/// Frame written to every node page: the encoded node plus a checksum over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWithChecksum {
    pub checksum: u32,
    pub body: Vec<u8>,
}

impl PageWithChecksum {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            checksum: Self::crc32(&body),
            body,
        }
    }

    /// CRC-32/BZIP2, computed bitwise.
    pub fn crc32(data: &[u8]) -> u32 {
        const POLY: u32 = 0x04C11DB7;
        let mut crc: u32 = 0xFFFFFFFF;

        for &byte in data {
            crc ^= (byte as u32) << 24;
            for _ in 0..8 {
                crc = if crc & 0x80000000 != 0 {
                    (crc << 1) ^ POLY
                } else {
                    crc << 1
                };
            }
        }

        crc ^ 0xFFFFFFFF
    }

    pub fn verify(&self) -> StorageResult<()> {
        let actual = Self::crc32(&self.body);
        if actual != self.checksum {
            return Err(StorageError::Corrupt(format!(
                "checksum mismatch: expected {:#010x}, found {:#010x}",
                self.checksum, actual
            )));
        }
        Ok(())
    }
}

/// Record written to a page on the free list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreePage {
    pub marker: u32,
    pub next_free: PageId,
}

impl FreePage {
    pub fn new(next_free: PageId) -> Self {
        Self {
            marker: FREE_PAGE_MARKER,
            next_free,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.marker == FREE_PAGE_MARKER
    }
}

// ============================================================================
// File Header
// ============================================================================

/// Page 0 of every store. Field order is the on-disk order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u16,
    pub dimensions: u8,
    pub page_size: u32,
    pub fanout: u16,
    pub split_strategy: u8,
    pub root_page: PageId,
    pub min_fill: u16,
    pub next_page_id: PageId,
    pub free_list_head: PageId,
    pub free_page_count: u64,
    pub entry_count: u64,
    pub height: u32,
    pub max_identifier_len: u16,
    pub reference_system: String,
}

impl FileHeader {
    /// Header for a fresh store with no pages beyond the header itself.
    ///
    /// The config must already be validated, so the narrowing casts are lossless.
    pub fn new(config: &TreeConfig, split_strategy: u8) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            dimensions: config.dimensions() as u8,
            page_size: config.page_size() as u32,
            fanout: config.fanout() as u16,
            min_fill: config.min_fill() as u16,
            split_strategy,
            root_page: NULL_PAGE,
            next_page_id: 1,
            free_list_head: NULL_PAGE,
            free_page_count: 0,
            entry_count: 0,
            height: 0,
            max_identifier_len: config.max_identifier_len() as u16,
            reference_system: config.reference_system().code().to_string(),
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.magic != MAGIC {
            return Err(StorageError::IncompatibleFormat(format!(
                "bad magic number {:#010x}",
                self.magic
            )));
        }
        if self.version != VERSION {
            return Err(StorageError::IncompatibleFormat(format!(
                "unsupported format version {}",
                self.version
            )));
        }
        Ok(())
    }

    /// The effective configuration of a store opened with `expected`:
    /// format fields and the reference system come from the header, tuning
    /// fields from `expected`.
    pub fn tree_config(&self, expected: &TreeConfig) -> TreeConfig {
        let split = SplitKind::from_code(self.split_strategy).unwrap_or(expected.split());
        expected
            .clone()
            .with_fanout(self.fanout as usize)
            .with_min_fill(self.min_fill as usize)
            .with_max_identifier_len(self.max_identifier_len as usize)
            .with_split(split)
            .with_reference_system(ReferenceSystem::new(self.reference_system.clone()))
    }
}
