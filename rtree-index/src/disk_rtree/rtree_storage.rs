//! Paged node store.
//!
//! Two layers live here:
//! - [`PageFile`] does raw page I/O: each read or write is one seek plus one
//!   page-sized transfer, so a page is never half-written by this process.
//! - [`NodeStore`] adds the header, the free list, the write-back page cache
//!   and I/O statistics on top of it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::persistence::FreeListManager;
use super::rtree_cache::PageCache;
use super::rtree_constants::{MIN_PAGE_SIZE, NULL_PAGE};
use super::rtree_types::{FileHeader, FreePage, Node, PageId, PageWithChecksum, RTreeStats};
use crate::config::TreeConfig;
use crate::errors::{StorageError, StorageResult};

/// Upper bound on the memory a single page decode may claim.
const DECODE_LIMIT: usize = 16 << 20;

fn codec() -> impl bincode::config::Config {
    bincode::config::legacy().with_limit::<DECODE_LIMIT>()
}

fn encode<T: serde::Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::legacy())
        .map_err(|e| StorageError::Corrupt(format!("encode failed: {}", e)))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> StorageResult<T> {
    bincode::serde::decode_from_slice(bytes, codec())
        .map(|(value, _)| value)
        .map_err(|e| StorageError::Corrupt(format!("cannot decode {}: {}", what, e)))
}

/// Raw page-granular access to the store file.
pub struct PageFile {
    file: Mutex<File>,
    path: PathBuf,
    page_size: usize,
}

impl PageFile {
    /// Create (or truncate) a store file
    pub fn create(path: &Path, page_size: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size,
        })
    }

    /// Open an existing store file and read its header.
    pub fn open(path: &Path) -> StorageResult<(Self, FileHeader)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut prefix = vec![0u8; MIN_PAGE_SIZE];
        file.seek(SeekFrom::Start(0))?;
        if let Err(e) = file.read_exact(&mut prefix) {
            return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
                StorageError::IncompatibleFormat("file is shorter than a header page".into())
            } else {
                StorageError::Io(e)
            });
        }
        let header: FileHeader = bincode::serde::decode_from_slice(&prefix, codec())
            .map(|(header, _)| header)
            .map_err(|e| StorageError::IncompatibleFormat(format!("unreadable header: {}", e)))?;
        header.validate()?;

        let page_file = Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size: header.page_size as usize,
        };
        Ok((page_file, header))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of whole pages currently in the file
    pub fn page_count(&self) -> StorageResult<u64> {
        let len = self.file.lock().metadata()?.len();
        Ok(len / self.page_size as u64)
    }

    pub fn write_header(&self, header: &FileHeader) -> StorageResult<()> {
        let bytes = encode(header)?;
        self.write_padded(0, bytes)
    }

    /// Read a single node (one seek + one read) and verify its checksum.
    pub fn read_node(&self, page_id: PageId) -> StorageResult<Node> {
        let buffer = self.read_raw(page_id)?;
        let page: PageWithChecksum = decode(&buffer, "page frame")?;
        page.verify()
            .map_err(|e| StorageError::Corrupt(format!("page {}: {}", page_id, e)))?;
        decode(&page.body, "node")
    }

    /// Write a single node with its checksum.
    pub fn write_node(&self, page_id: PageId, node: &Node) -> StorageResult<()> {
        let bytes = Self::encode_node(node, self.page_size)?;
        self.write_padded(page_id, bytes)
    }

    /// Encode a node frame, rejecting it if it does not fit in one page.
    pub fn encode_node(node: &Node, page_size: usize) -> StorageResult<Vec<u8>> {
        let frame = PageWithChecksum::new(encode(node)?);
        let bytes = encode(&frame)?;
        if bytes.len() > page_size {
            return Err(StorageError::PageOverflow {
                size: bytes.len(),
                page_size,
            });
        }
        Ok(bytes)
    }

    pub fn read_free_page(&self, page_id: PageId) -> StorageResult<FreePage> {
        let buffer = self.read_raw(page_id)?;
        let free_page: FreePage = decode(&buffer, "free page")?;
        if !free_page.is_valid() {
            return Err(StorageError::Corrupt(format!(
                "page {} is on the free list but is not marked free",
                page_id
            )));
        }
        Ok(free_page)
    }

    pub fn write_free_page(&self, page_id: PageId, free_page: &FreePage) -> StorageResult<()> {
        let bytes = encode(free_page)?;
        self.write_padded(page_id, bytes)
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Shrink the file to `pages` pages.
    pub fn truncate(&self, pages: u64) -> StorageResult<()> {
        self.file.lock().set_len(pages * self.page_size as u64)?;
        Ok(())
    }

    fn read_raw(&self, page_id: PageId) -> StorageResult<Vec<u8>> {
        if page_id == NULL_PAGE {
            return Err(StorageError::Corrupt(
                "page 0 is the header, not a node".into(),
            ));
        }

        let offset = page_id * self.page_size as u64;
        let mut buffer = vec![0u8; self.page_size];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buffer).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StorageError::Corrupt(format!("page {} lies past the end of the file", page_id))
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(buffer)
    }

    fn write_padded(&self, page_id: PageId, mut bytes: Vec<u8>) -> StorageResult<()> {
        bytes.resize(self.page_size, 0);
        let offset = page_id * self.page_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

/// Persistent map from page ids to nodes, with a header, a free list and a page cache.
pub struct NodeStore {
    file: PageFile,
    config: TreeConfig,
    header: RwLock<FileHeader>,
    cache: Mutex<PageCache>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
    closed: AtomicBool,
}

impl NodeStore {
    /// Create a new, empty store. Any existing file at `path` is replaced.
    pub fn create(path: &Path, config: &TreeConfig, split_strategy: u8) -> StorageResult<Self> {
        config.validate()?;

        let file = PageFile::create(path, config.page_size())?;
        let header = FileHeader::new(config, split_strategy);
        file.write_header(&header)?;
        file.sync()?;

        log::debug!(
            "Created node store at {:?} (page size {}, fanout {}, {} dimensions)",
            path,
            config.page_size(),
            config.fanout(),
            config.dimensions()
        );
        Ok(Self::from_parts(file, config.clone(), header))
    }

    /// Open an existing store, checking it against the caller's expectations.
    ///
    /// Dimensionality, page size and reference system must match `expected`;
    /// fanout, fill and split strategy are taken from the file.
    pub fn open(path: &Path, expected: &TreeConfig) -> StorageResult<Self> {
        let (file, header) = PageFile::open(path)?;

        if header.dimensions as usize != expected.dimensions() {
            return Err(StorageError::IncompatibleFormat(format!(
                "store has {} dimensions, expected {}",
                header.dimensions,
                expected.dimensions()
            )));
        }
        if header.page_size as usize != expected.page_size() {
            return Err(StorageError::IncompatibleFormat(format!(
                "store uses {}-byte pages, expected {}",
                header.page_size,
                expected.page_size()
            )));
        }

        if header.reference_system != expected.reference_system().code() {
            return Err(StorageError::IncompatibleFormat(format!(
                "store uses reference system {}, expected {}",
                header.reference_system,
                expected.reference_system()
            )));
        }

        let config = header.tree_config(expected);
        config
            .validate()
            .map_err(|e| StorageError::IncompatibleFormat(format!("stored parameters rejected: {}", e)))?;

        let pages_on_disk = file.page_count()?;
        if pages_on_disk < header.next_page_id {
            return Err(StorageError::Corrupt(format!(
                "file holds {} pages but header claims {}",
                pages_on_disk, header.next_page_id
            )));
        }

        log::debug!(
            "Opened node store at {:?} ({} entries, height {})",
            path,
            header.entry_count,
            header.height
        );
        Ok(Self::from_parts(file, config, header))
    }

    fn from_parts(file: PageFile, config: TreeConfig, header: FileHeader) -> Self {
        Self {
            cache: Mutex::new(PageCache::new(config.cache_pages())),
            file,
            config,
            header: RwLock::new(header),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            disk_reads: AtomicU64::new(0),
            disk_writes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn check_closed(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Effective configuration: stored format fields merged with caller tuning.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn page_size(&self) -> usize {
        self.file.page_size()
    }

    pub fn header(&self) -> FileHeader {
        self.header.read().clone()
    }

    pub fn root_page(&self) -> PageId {
        self.header.read().root_page
    }

    pub fn height(&self) -> u32 {
        self.header.read().height
    }

    pub fn entry_count(&self) -> u64 {
        self.header.read().entry_count
    }

    pub fn set_root(&self, root_page: PageId, height: u32) {
        let mut header = self.header.write();
        header.root_page = root_page;
        header.height = height;
    }

    pub fn set_entry_count(&self, entry_count: u64) {
        self.header.write().entry_count = entry_count;
    }

    /// Hand out an unused page, preferring the free list.
    pub fn allocate_page(&self) -> StorageResult<PageId> {
        self.check_closed()?;
        let mut header = self.header.write();
        let page_id = FreeListManager::allocate_page(&self.file, &mut header)?;
        log::trace!("Allocated page {}", page_id);
        Ok(page_id)
    }

    /// Return a page to the free list. It must not be read again until reallocated.
    pub fn free_page(&self, page_id: PageId) -> StorageResult<()> {
        self.check_closed()?;
        self.cache.lock().remove(page_id);
        let mut header = self.header.write();
        FreeListManager::free_page(&self.file, &mut header, page_id)?;
        self.disk_writes.fetch_add(1, Ordering::Relaxed);
        log::trace!("Freed page {}", page_id);
        Ok(())
    }

    /// Read a node, from the cache when possible.
    pub fn read_node(&self, page_id: PageId) -> StorageResult<Node> {
        self.check_closed()?;
        let next_page_id = self.header.read().next_page_id;
        if page_id == NULL_PAGE || page_id >= next_page_id {
            return Err(StorageError::Corrupt(format!(
                "page {} is outside the allocated range 1..{}",
                page_id, next_page_id
            )));
        }

        let mut cache = self.cache.lock();
        if let Some(node) = cache.get(page_id) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(node.clone());
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let node = self.file.read_node(page_id)?;
        self.disk_reads.fetch_add(1, Ordering::Relaxed);
        self.validate_node(page_id, &node)?;

        if let Some((evicted_id, evicted)) = cache.insert(page_id, node.clone(), false) {
            if evicted.dirty {
                self.write_back(evicted_id, &evicted.node)?;
            }
        }
        Ok(node)
    }

    /// Buffer a node write; it reaches disk on eviction or flush.
    pub fn write_node(&self, page_id: PageId, node: &Node) -> StorageResult<()> {
        self.check_closed()?;
        if page_id == NULL_PAGE {
            return Err(StorageError::Corrupt("cannot write a node to page 0".into()));
        }
        PageFile::encode_node(node, self.file.page_size())?;

        let mut cache = self.cache.lock();
        if let Some((evicted_id, evicted)) = cache.insert(page_id, node.clone(), true) {
            if evicted.dirty {
                self.write_back(evicted_id, &evicted.node)?;
            }
        }
        Ok(())
    }

    fn write_back(&self, page_id: PageId, node: &Node) -> StorageResult<()> {
        self.file.write_node(page_id, node)?;
        self.disk_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn validate_node(&self, page_id: PageId, node: &Node) -> StorageResult<()> {
        if node.len() > self.config.fanout() {
            return Err(StorageError::Corrupt(format!(
                "page {} holds {} entries, fanout is {}",
                page_id,
                node.len(),
                self.config.fanout()
            )));
        }
        if let Node::Branch { level: 0, .. } = node {
            return Err(StorageError::Corrupt(format!(
                "page {} is a branch at level 0",
                page_id
            )));
        }
        let dims = self.config.dimensions();
        let wrong_dims = node.entry_bounds().iter().any(|b| b.dimensions() != dims);
        if wrong_dims {
            return Err(StorageError::Corrupt(format!(
                "page {} holds entries that are not {}-dimensional",
                page_id, dims
            )));
        }
        Ok(())
    }

    /// Write every dirty page and the header, then sync.
    pub fn flush(&self) -> StorageResult<()> {
        self.check_closed()?;
        let mut cache = self.cache.lock();
        for page_id in cache.dirty_pages() {
            if let Some(cached) = cache.peek(page_id) {
                self.file.write_node(page_id, &cached.node)?;
                self.disk_writes.fetch_add(1, Ordering::Relaxed);
            }
            cache.mark_clean(page_id);
        }
        drop(cache);

        self.file.write_header(&self.header.read())?;
        self.file.sync()?;
        Ok(())
    }

    /// Free every node page at once, leaving a store with no root.
    pub fn reset(&self) -> StorageResult<()> {
        self.check_closed()?;
        let mut cache = self.cache.lock();
        let mut header = self.header.write();
        cache.clear();
        header.root_page = NULL_PAGE;
        header.height = 0;
        header.entry_count = 0;
        header.next_page_id = 1;
        header.free_list_head = NULL_PAGE;
        header.free_page_count = 0;
        self.file.truncate(1)?;
        self.file.write_header(&header)?;
        log::debug!("Reset node store at {:?}", self.file.path());
        Ok(())
    }

    /// Flush and stop accepting calls. Calling it again is a no-op.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush()?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read the free list chain without modifying it.
    pub fn free_list(&self) -> StorageResult<Vec<PageId>> {
        let header = self.header.read();
        FreeListManager::walk(&self.file, &header)
    }

    pub fn stats(&self) -> RTreeStats {
        let cached_pages = self.cache.lock().len();
        let header = self.header.read();
        RTreeStats {
            total_entries: header.entry_count,
            tree_height: header.height,
            page_count: header.next_page_id.saturating_sub(1),
            free_pages: header.free_page_count,
            cached_pages,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
        }
    }
}
