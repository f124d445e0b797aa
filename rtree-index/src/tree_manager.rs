//! Registry of open trees, one per storage location.
//!
//! A [`TreeRegistry`] hands out shared [`RTree`] handles keyed by location and
//! keeps advisory track of which owners hold each one. Opening is serialized
//! per location, so racing callers end up with the same store and mapper.
//!
//! Lock discipline: the table lock only guards the map of slots and is never
//! held while waiting for a slot. A slot lock may be held while briefly taking
//! the table lock to retire the slot.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ManagerConfig, TreeConfig};
use crate::disk_rtree::rtree_constants::{ELEMENTS_DIR_NAME, TREE_FILE_NAME};
use crate::disk_rtree::RTree;
use crate::errors::{ManagerError, ManagerResult, OpenFailure, StorageError};
use crate::mapper::{table_name_for, ElementMapper, FileElementMapper, SqlElementMapper};

/// Opaque name of a party holding a tree open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OwnerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct CachedTree {
    tree: RTree,
    owners: Vec<OwnerId>,
}

#[derive(Default)]
struct Slot {
    cached: Option<CachedTree>,
    /// Set once the slot has left the table; holders must look it up again.
    retired: bool,
}

type SlotHandle = Arc<Mutex<Slot>>;

/// Shared registry of open trees.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct TreeRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: ManagerConfig,
    table: Mutex<HashMap<PathBuf, SlotHandle>>,
}

impl TreeRegistry {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                table: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// The tree stored at `location`, opened or created with the registry's
    /// default tree configuration.
    pub fn get_or_open(&self, location: impl AsRef<Path>, owner: &OwnerId) -> ManagerResult<RTree> {
        let config = self.inner.config.tree_defaults();
        self.get_or_open_with(location, owner, &config)
    }

    /// The tree stored at `location`, opened or created with `config`.
    ///
    /// If the tree is already open, `owner` is added to its owners and the
    /// shared handle is returned, provided its dimensionality, page size and
    /// reference system agree with `config`.
    pub fn get_or_open_with(
        &self,
        location: impl AsRef<Path>,
        owner: &OwnerId,
        config: &TreeConfig,
    ) -> ManagerResult<RTree> {
        let key = location_key(location.as_ref());
        loop {
            let slot = self.slot(&key);
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }

            if let Some(cached) = guard.cached.as_mut() {
                if !cached.tree.is_closed() {
                    check_compatible(&key, &cached.tree, config)?;
                    if !cached.owners.contains(owner) {
                        cached.owners.push(owner.clone());
                    }
                    log::debug!("Reusing open tree at {:?} for {}", key, owner);
                    return Ok(cached.tree.clone());
                }
                log::debug!("Cached tree at {:?} was closed; reopening", key);
                guard.cached = None;
            }

            return match self.open_tree(&key, config) {
                Ok(tree) => {
                    guard.cached = Some(CachedTree {
                        tree: tree.clone(),
                        owners: vec![owner.clone()],
                    });
                    Ok(tree)
                }
                Err(source) => {
                    self.retire(&key, &slot, &mut guard);
                    Err(ManagerError::Open {
                        location: key,
                        source,
                    })
                }
            };
        }
    }

    /// Flush `tree` and clear it in place, keeping its location.
    pub fn reset(&self, location: impl AsRef<Path>, tree: &RTree, owner: &OwnerId) -> ManagerResult<()> {
        let key = location_key(location.as_ref());
        let cached = self.cached_tree(&key);
        if !cached.is_some_and(|c| c.ptr_eq(tree)) {
            log::warn!("Resetting a tree that is not the one registered at {:?}", key);
        }
        log::info!("Resetting tree at {:?} for {}", key, owner);
        tree.flush()?;
        tree.clear()?;
        Ok(())
    }

    /// Delete everything stored for `location`: the directory and, with a SQL
    /// datasource, the element table. Any cached handle is closed first.
    ///
    /// Callers must make sure no owner still uses the tree.
    pub fn remove(&self, location: impl AsRef<Path>) -> ManagerResult<()> {
        let key = location_key(location.as_ref());
        let slot = self.inner.table.lock().remove(&key);
        if let Some(slot) = slot {
            let mut guard = slot.lock();
            guard.retired = true;
            if let Some(cached) = guard.cached.take() {
                if let Err(err) = cached.tree.close() {
                    log::warn!("Failed to close tree at {:?} before removal: {}", key, err);
                }
            }
        }

        match fs::remove_dir_all(&key) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(ManagerError::Remove {
                    location: key,
                    source: StorageError::from(err).into(),
                })
            }
        }

        if let Some(datasource) = self.inner.config.datasource() {
            let table = table_name_for(&key);
            if let Err(err) = SqlElementMapper::drop_table(datasource.pool(), datasource.dialect(), &table) {
                return Err(ManagerError::Remove {
                    location: key,
                    source: err.into(),
                });
            }
        }

        log::info!("Removed tree at {:?}", key);
        Ok(())
    }

    /// Unregister `owner`. The tree is closed and evicted when its last owner
    /// leaves. Returns whether `owner` was registered.
    pub fn release(&self, location: impl AsRef<Path>, owner: &OwnerId) -> ManagerResult<bool> {
        let key = location_key(location.as_ref());
        let Some(slot) = self.lookup(&key) else {
            return Ok(false);
        };
        let mut guard = slot.lock();
        let Some(cached) = guard.cached.as_mut() else {
            return Ok(false);
        };
        let Some(pos) = cached.owners.iter().position(|o| o == owner) else {
            return Ok(false);
        };
        cached.owners.remove(pos);
        if !cached.owners.is_empty() {
            return Ok(true);
        }

        let evicted = guard.cached.take();
        self.retire(&key, &slot, &mut guard);
        drop(guard);
        if let Some(evicted) = evicted {
            log::info!("Last owner released tree at {:?}; closing it", key);
            evicted.tree.close()?;
        }
        Ok(true)
    }

    /// Owners registered for `location`, in registration order.
    pub fn owners(&self, location: impl AsRef<Path>) -> Vec<OwnerId> {
        let key = location_key(location.as_ref());
        self.lookup(&key)
            .and_then(|slot| slot.lock().cached.as_ref().map(|c| c.owners.clone()))
            .unwrap_or_default()
    }

    /// Whether an open tree is registered for `location`.
    pub fn is_open(&self, location: impl AsRef<Path>) -> bool {
        let key = location_key(location.as_ref());
        self.cached_tree(&key).is_some_and(|tree| !tree.is_closed())
    }

    /// Locations that currently have a registry entry.
    pub fn open_locations(&self) -> Vec<PathBuf> {
        let mut locations: Vec<PathBuf> = self.inner.table.lock().keys().cloned().collect();
        locations.sort();
        locations
    }

    /// Close every registered tree and empty the table.
    ///
    /// Every tree is attempted; the first failure is returned.
    pub fn close_all(&self) -> ManagerResult<()> {
        let slots: Vec<(PathBuf, SlotHandle)> = self.inner.table.lock().drain().collect();
        let mut first_error = None;
        for (key, slot) in slots {
            let mut guard = slot.lock();
            guard.retired = true;
            if let Some(cached) = guard.cached.take() {
                log::info!("Closing tree at {:?}", key);
                if let Err(err) = cached.tree.close() {
                    log::warn!("Failed to close tree at {:?}: {}", key, err);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn slot(&self, key: &Path) -> SlotHandle {
        self.inner
            .table
            .lock()
            .entry(key.to_path_buf())
            .or_default()
            .clone()
    }

    fn lookup(&self, key: &Path) -> Option<SlotHandle> {
        self.inner.table.lock().get(key).cloned()
    }

    fn cached_tree(&self, key: &Path) -> Option<RTree> {
        let slot = self.lookup(key)?;
        let guard = slot.lock();
        guard.cached.as_ref().map(|c| c.tree.clone())
    }

    /// Take `slot` out of the table. The caller holds the slot lock.
    fn retire(&self, key: &Path, slot: &SlotHandle, guard: &mut Slot) {
        guard.retired = true;
        let mut table = self.inner.table.lock();
        if table.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            table.remove(key);
            log::debug!("Evicted registry entry for {:?}", key);
        }
    }

    fn open_tree(&self, location: &Path, config: &TreeConfig) -> Result<RTree, OpenFailure> {
        fs::create_dir_all(location).map_err(StorageError::from)?;

        let mapper: Arc<dyn ElementMapper> = match self.inner.config.datasource() {
            Some(datasource) => Arc::new(SqlElementMapper::open(
                datasource.pool().clone(),
                datasource.dialect(),
                &table_name_for(location),
            )?),
            None => Arc::new(FileElementMapper::open(&location.join(ELEMENTS_DIR_NAME))?),
        };

        let tree_path = location.join(TREE_FILE_NAME);
        let existed = tree_path.exists();
        let result = if existed {
            RTree::open(&tree_path, config, mapper.clone())
        } else {
            RTree::create(&tree_path, config, mapper.clone())
        };

        match result {
            Ok(tree) => {
                log::info!(
                    "{} tree at {:?} ({} entries)",
                    if existed { "Opened" } else { "Created" },
                    location,
                    tree.len()
                );
                Ok(tree)
            }
            Err(err) => {
                log::warn!("Failed to open tree at {:?}: {}", location, err);
                if let Err(close_err) = mapper.close() {
                    log::warn!("Failed to close element mapper for {:?}: {}", location, close_err);
                }
                if !existed {
                    if let Err(rm_err) = fs::remove_file(&tree_path) {
                        if rm_err.kind() != io::ErrorKind::NotFound {
                            log::warn!("Failed to remove partial tree file {:?}: {}", tree_path, rm_err);
                        }
                    }
                }
                Err(err.into())
            }
        }
    }
}

fn location_key(location: &Path) -> PathBuf {
    std::path::absolute(location).unwrap_or_else(|_| location.to_path_buf())
}

fn check_compatible(location: &Path, tree: &RTree, requested: &TreeConfig) -> ManagerResult<()> {
    let current = tree.config();
    let reason = if current.dimensions() != requested.dimensions() {
        Some(format!(
            "open with {} dimensions, requested {}",
            current.dimensions(),
            requested.dimensions()
        ))
    } else if current.page_size() != requested.page_size() {
        Some(format!(
            "open with {}-byte pages, requested {}",
            current.page_size(),
            requested.page_size()
        ))
    } else if current.reference_system() != requested.reference_system() {
        Some(format!(
            "open in {}, requested {}",
            current.reference_system(),
            requested.reference_system()
        ))
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ManagerError::AlreadyOpenElsewhereIncompatibly {
            location: location.to_path_buf(),
            reason,
        }),
        None => Ok(()),
    }
}
