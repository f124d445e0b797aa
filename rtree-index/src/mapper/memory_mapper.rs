use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::ElementMapper;
use crate::envelope::NamedEnvelope;
use crate::errors::{MapperError, MapperResult};

/// Volatile element mapper; contents vanish with the value.
#[derive(Default)]
pub struct MemoryElementMapper {
    records: RwLock<HashMap<String, NamedEnvelope>>,
    closed: AtomicBool,
}

impl MemoryElementMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_opened(&self) -> MapperResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MapperError::Closed);
        }
        Ok(())
    }
}

impl ElementMapper for MemoryElementMapper {
    fn put(&self, envelope: &NamedEnvelope) -> MapperResult<()> {
        self.check_opened()?;
        self.records
            .write()
            .insert(envelope.identifier().to_string(), envelope.clone());
        Ok(())
    }

    fn get(&self, identifier: &str) -> MapperResult<Option<NamedEnvelope>> {
        self.check_opened()?;
        Ok(self.records.read().get(identifier).cloned())
    }

    fn remove(&self, identifier: &str) -> MapperResult<bool> {
        self.check_opened()?;
        Ok(self.records.write().remove(identifier).is_some())
    }

    fn clear(&self) -> MapperResult<()> {
        self.check_opened()?;
        self.records.write().clear();
        Ok(())
    }

    fn len(&self) -> MapperResult<u64> {
        self.check_opened()?;
        Ok(self.records.read().len() as u64)
    }

    fn flush(&self) -> MapperResult<()> {
        self.check_opened()
    }

    fn close(&self) -> MapperResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
