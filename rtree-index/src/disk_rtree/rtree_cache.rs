//! LRU cache for R-Tree pages.
//!
//! Pages enter the cache only when first read or written; nothing is preloaded.
//! Written pages are kept dirty until the store flushes them or evicts them.

use std::num::NonZeroUsize;

use lru::LruCache;

use super::rtree_types::{Node, PageId};

/// A cached page with its data and dirty flag
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub node: Node,
    pub dirty: bool,
}

/// Bounded write-back page cache.
pub struct PageCache {
    pages: LruCache<PageId, CachedPage>,
}

impl PageCache {
    /// Create a cache holding at most `max_pages` pages (at least one).
    pub fn new(max_pages: usize) -> Self {
        let cap = NonZeroUsize::new(max_pages.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            pages: LruCache::new(cap),
        }
    }

    /// Get a page, marking it most recently used.
    pub fn get(&mut self, page_id: PageId) -> Option<&Node> {
        self.pages.get(&page_id).map(|cached| &cached.node)
    }

    /// Insert or replace a page.
    ///
    /// Returns the least recently used page when inserting pushed it out, so
    /// the caller can write it back if dirty. Replacing an existing page
    /// never returns anything: the new contents supersede the old.
    pub fn insert(&mut self, page_id: PageId, node: Node, dirty: bool) -> Option<(PageId, CachedPage)> {
        let dirty = dirty || self.pages.peek(&page_id).is_some_and(|c| c.dirty);
        match self.pages.push(page_id, CachedPage { node, dirty }) {
            Some((evicted_id, _)) if evicted_id == page_id => None,
            evicted => evicted,
        }
    }

    /// All dirty page ids
    pub fn dirty_pages(&self) -> Vec<PageId> {
        self.pages
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Borrow a page without touching LRU order.
    pub fn peek(&self, page_id: PageId) -> Option<&CachedPage> {
        self.pages.peek(&page_id)
    }

    pub fn mark_clean(&mut self, page_id: PageId) {
        if let Some(cached) = self.pages.peek_mut(&page_id) {
            cached.dirty = false;
        }
    }

    pub fn remove(&mut self, page_id: PageId) -> Option<CachedPage> {
        self.pages.pop(&page_id)
    }

    /// Drop every page, dirty or not.
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.contains(&page_id)
    }
}
