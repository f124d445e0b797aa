//! Free list management and structural integrity checking.

use std::collections::HashSet;

use super::rtree_constants::NULL_PAGE;
use super::rtree_storage::{NodeStore, PageFile};
use super::rtree_types::{FileHeader, FreePage, Node, PageId};
use crate::envelope::Bounds;
use crate::errors::{StorageError, StorageResult};

/// Result of a read-only integrity walk over a store.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// Node pages visited from the root
    pub pages_checked: u64,
    /// Leaf entries found during the walk
    pub entries_found: u64,
    /// Pages whose contents could not be decoded or failed their checksum
    pub corrupted_pages: Vec<PageId>,
    /// Allocated pages that are neither reachable from the root nor free
    pub orphaned_pages: Vec<PageId>,
    /// Pages on the free list
    pub free_pages: Vec<PageId>,
    /// Detailed findings
    pub errors: Vec<String>,
    /// True when nothing above was found wrong
    pub is_valid: bool,
}

impl IntegrityReport {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            ..Default::default()
        }
    }
}

/// Maintains the singly linked chain of free pages rooted in the header.
pub struct FreeListManager;

impl FreeListManager {
    /// Allocate a page from the free list or extend the file
    pub fn allocate_page(file: &PageFile, header: &mut FileHeader) -> StorageResult<PageId> {
        if header.free_list_head != NULL_PAGE {
            let page_id = header.free_list_head;
            let free_page = file.read_free_page(page_id)?;

            header.free_list_head = free_page.next_free;
            header.free_page_count = header.free_page_count.saturating_sub(1);
            Ok(page_id)
        } else {
            let page_id = header.next_page_id;
            header.next_page_id = header.next_page_id.saturating_add(1);
            Ok(page_id)
        }
    }

    /// Push a page onto the free list
    pub fn free_page(file: &PageFile, header: &mut FileHeader, page_id: PageId) -> StorageResult<()> {
        if page_id == NULL_PAGE || page_id >= header.next_page_id {
            return Err(StorageError::Corrupt(format!(
                "cannot free unallocated page {}",
                page_id
            )));
        }
        file.write_free_page(page_id, &FreePage::new(header.free_list_head))?;
        header.free_list_head = page_id;
        header.free_page_count = header.free_page_count.saturating_add(1);
        Ok(())
    }

    /// Follow the chain from the head, failing on cycles or dangling links.
    pub fn walk(file: &PageFile, header: &FileHeader) -> StorageResult<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut seen = HashSet::new();
        let mut next = header.free_list_head;

        while next != NULL_PAGE {
            if next >= header.next_page_id || !seen.insert(next) {
                return Err(StorageError::Corrupt(format!(
                    "free list is broken at page {}",
                    next
                )));
            }
            pages.push(next);
            next = file.read_free_page(next)?.next_free;
        }

        if pages.len() as u64 != header.free_page_count {
            return Err(StorageError::Corrupt(format!(
                "free list holds {} pages, header counts {}",
                pages.len(),
                header.free_page_count
            )));
        }
        Ok(pages)
    }
}

/// Walk the whole tree and report structural problems without modifying anything.
///
/// Checks: every leaf sits at the same depth, node fill stays within bounds,
/// every recorded child box equals the tight box of that child, identifiers are
/// unique, the entry count matches the header, and every allocated page is
/// either reachable or free.
pub fn check_integrity(store: &NodeStore) -> StorageResult<IntegrityReport> {
    let header = store.header();
    let config = store.config();
    let dims = config.dimensions();
    let mut report = IntegrityReport::new();
    let mut reachable: HashSet<PageId> = HashSet::new();
    let mut identifiers: HashSet<String> = HashSet::new();

    if header.root_page == NULL_PAGE || header.height == 0 {
        report.errors.push("store has no root page".into());
    } else {
        let mut stack: Vec<(PageId, u32, Option<Bounds>)> =
            vec![(header.root_page, header.height - 1, None)];

        while let Some((page_id, expected_level, recorded)) = stack.pop() {
            if !reachable.insert(page_id) {
                report
                    .errors
                    .push(format!("page {} is referenced more than once", page_id));
                continue;
            }
            report.pages_checked += 1;

            let node = match store.read_node(page_id) {
                Ok(node) => node,
                Err(StorageError::Corrupt(msg)) => {
                    report.corrupted_pages.push(page_id);
                    report.errors.push(msg);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if node.level() != expected_level {
                report.errors.push(format!(
                    "page {} is at level {}, expected {}",
                    page_id,
                    node.level(),
                    expected_level
                ));
            }

            let is_root = recorded.is_none();
            let min = match (is_root, node.is_leaf()) {
                (true, true) => 0,
                (true, false) => 2,
                (false, _) => config.min_fill(),
            };
            if node.len() < min || node.len() > config.fanout() {
                report.errors.push(format!(
                    "page {} holds {} entries, allowed {}..={}",
                    page_id,
                    node.len(),
                    min,
                    config.fanout()
                ));
            }

            if let Some(recorded) = recorded {
                let actual = node.compute_bounds(dims);
                if recorded != actual {
                    report.errors.push(format!(
                        "page {} is recorded as {} but covers {}",
                        page_id, recorded, actual
                    ));
                }
            }

            match node {
                Node::Leaf { entries } => {
                    report.entries_found += entries.len() as u64;
                    for entry in entries {
                        if !identifiers.insert(entry.identifier.clone()) {
                            report.errors.push(format!(
                                "identifier {} is indexed more than once",
                                entry.identifier
                            ));
                        }
                    }
                }
                Node::Branch { children, .. } => {
                    let child_level = expected_level.saturating_sub(1);
                    for child in children {
                        stack.push((child.page_id, child_level, Some(child.bounds)));
                    }
                }
            }
        }
    }

    if report.entries_found != header.entry_count {
        report.errors.push(format!(
            "tree holds {} entries, header counts {}",
            report.entries_found, header.entry_count
        ));
    }

    match store.free_list() {
        Ok(free) => report.free_pages = free,
        Err(StorageError::Corrupt(msg)) => report.errors.push(msg),
        Err(e) => return Err(e),
    }

    let free: HashSet<PageId> = report.free_pages.iter().copied().collect();
    for page_id in free.intersection(&reachable) {
        report
            .errors
            .push(format!("page {} is both reachable and free", page_id));
    }
    report.orphaned_pages = (1..header.next_page_id)
        .filter(|id| !reachable.contains(id) && !free.contains(id))
        .collect();

    report.is_valid = report.errors.is_empty()
        && report.corrupted_pages.is_empty()
        && report.orphaned_pages.is_empty();

    if !report.is_valid {
        log::warn!(
            "Integrity check of {:?} found {} problems",
            store.path(),
            report.errors.len() + report.corrupted_pages.len() + report.orphaned_pages.len()
        );
    }
    Ok(report)
}
