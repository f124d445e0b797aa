use std::ops::RangeFull;
use std::path::{Path, PathBuf};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::RwLock;

use super::ElementMapper;
use crate::envelope::NamedEnvelope;
use crate::errors::{MapperError, MapperResult};

const PARTITION_NAME: &str = "elements";

struct FjallHandles {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

/// Element mapper backed by an embedded fjall keyspace.
///
/// Records are keyed by identifier and stored bincode-encoded in a single
/// partition. The keyspace journal is persisted on [`ElementMapper::flush`]
/// and on close.
pub struct FileElementMapper {
    path: PathBuf,
    handles: RwLock<Option<FjallHandles>>,
}

impl FileElementMapper {
    /// Open the keyspace at `path`, creating it if needed.
    pub fn open(path: &Path) -> MapperResult<Self> {
        let keyspace = match Keyspace::open(Config::new(path)) {
            Ok(keyspace) => keyspace,
            Err(err) => {
                log::error!("Failed to open element keyspace at {:?}: {}", path, err);
                return Err(err.into());
            }
        };
        let partition = keyspace.open_partition(PARTITION_NAME, PartitionCreateOptions::default())?;

        log::debug!("Opened element mapper at {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            handles: RwLock::new(Some(FjallHandles {
                keyspace,
                partition,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_handles<T>(&self, f: impl FnOnce(&FjallHandles) -> MapperResult<T>) -> MapperResult<T> {
        let guard = self.handles.read();
        match guard.as_ref() {
            Some(handles) => f(handles),
            None => Err(MapperError::Closed),
        }
    }

    fn encode(envelope: &NamedEnvelope) -> MapperResult<Vec<u8>> {
        bincode::serde::encode_to_vec(envelope, bincode::config::legacy())
            .map_err(|e| MapperError::Corrupt(e.to_string()))
    }

    fn decode(identifier: &str, bytes: &[u8]) -> MapperResult<NamedEnvelope> {
        bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
            .map(|(envelope, _)| envelope)
            .map_err(|e| MapperError::Corrupt(format!("record {}: {}", identifier, e)))
    }
}

impl ElementMapper for FileElementMapper {
    fn put(&self, envelope: &NamedEnvelope) -> MapperResult<()> {
        let bytes = Self::encode(envelope)?;
        self.with_handles(|h| {
            h.partition.insert(envelope.identifier(), bytes)?;
            Ok(())
        })
    }

    fn get(&self, identifier: &str) -> MapperResult<Option<NamedEnvelope>> {
        self.with_handles(|h| match h.partition.get(identifier)? {
            Some(bytes) => Ok(Some(Self::decode(identifier, &bytes)?)),
            None => Ok(None),
        })
    }

    fn remove(&self, identifier: &str) -> MapperResult<bool> {
        self.with_handles(|h| {
            if !h.partition.contains_key(identifier)? {
                return Ok(false);
            }
            h.partition.remove(identifier)?;
            Ok(true)
        })
    }

    fn clear(&self) -> MapperResult<()> {
        self.with_handles(|h| {
            let mut batch = h.keyspace.batch();
            for result in h.partition.range::<Vec<u8>, RangeFull>(..) {
                let (key, _) = result?;
                batch.remove(&h.partition, key);
            }
            batch.commit()?;
            Ok(())
        })
    }

    fn len(&self) -> MapperResult<u64> {
        self.with_handles(|h| Ok(h.partition.len()? as u64))
    }

    fn flush(&self) -> MapperResult<()> {
        self.with_handles(|h| {
            if let Err(err) = h.keyspace.persist(PersistMode::SyncAll) {
                log::error!("Failed to persist element keyspace at {:?}: {}", self.path, err);
                return Err(err.into());
            }
            Ok(())
        })
    }

    fn close(&self) -> MapperResult<()> {
        let handles = self.handles.write().take();
        if let Some(handles) = handles {
            handles.keyspace.persist(PersistMode::SyncAll)?;
            log::debug!("Closed element mapper at {:?}", self.path);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handles.read().is_none()
    }
}
