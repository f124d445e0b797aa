//! Element mappers: durable identifier → envelope maps kept next to a tree.
//!
//! The tree consults its mapper to reject duplicate identifiers and to find
//! the bounds of an identifier being removed. Backends:
//! - [`FileElementMapper`]: an embedded fjall keyspace beside the tree file
//! - [`SqlElementMapper`]: one table in a SQL database, in one of three dialects
//! - [`MemoryElementMapper`]: a volatile map, for tests and scratch trees

mod file_mapper;
mod memory_mapper;
mod sql_dialect;
mod sql_mapper;
mod sql_pool;

pub use file_mapper::FileElementMapper;
pub use memory_mapper::MemoryElementMapper;
pub use sql_dialect::{
    table_name_for, EmbeddedDialect, PostgresDialect, SimpleDialect, SqlDialect, SqlDialectKind,
};
pub use sql_mapper::SqlElementMapper;
pub use sql_pool::{PooledConnection, SqlConnectionPool};

use crate::envelope::NamedEnvelope;
use crate::errors::{MapperError, MapperResult};

/// Durable map from identifier to envelope record.
///
/// Every operation after [`ElementMapper::close`] fails with `MapperError::Closed`;
/// `close` itself may be called any number of times.
pub trait ElementMapper: Send + Sync {
    /// Insert or replace the record for `envelope.identifier()`.
    fn put(&self, envelope: &NamedEnvelope) -> MapperResult<()>;

    fn get(&self, identifier: &str) -> MapperResult<Option<NamedEnvelope>>;

    /// Like [`ElementMapper::get`], but a missing record is `MapperError::NotFound`.
    fn fetch(&self, identifier: &str) -> MapperResult<NamedEnvelope> {
        self.get(identifier)?
            .ok_or_else(|| MapperError::NotFound(identifier.to_string()))
    }

    /// Returns whether a record was removed.
    fn remove(&self, identifier: &str) -> MapperResult<bool>;

    fn clear(&self) -> MapperResult<()>;

    fn len(&self) -> MapperResult<u64>;

    fn is_empty(&self) -> MapperResult<bool> {
        Ok(self.len()? == 0)
    }

    fn contains(&self, identifier: &str) -> MapperResult<bool> {
        Ok(self.get(identifier)?.is_some())
    }

    /// Make every acknowledged write durable.
    fn flush(&self) -> MapperResult<()>;

    fn close(&self) -> MapperResult<()>;

    fn is_closed(&self) -> bool;
}

/// A SQL database that element mappers store their tables in.
#[derive(Clone)]
pub struct SqlDatasource {
    pool: SqlConnectionPool,
    dialect: SqlDialectKind,
}

impl SqlDatasource {
    pub fn new(pool: SqlConnectionPool, dialect: SqlDialectKind) -> Self {
        Self { pool, dialect }
    }

    pub fn pool(&self) -> &SqlConnectionPool {
        &self.pool
    }

    pub fn dialect(&self) -> SqlDialectKind {
        self.dialect
    }
}

impl std::fmt::Debug for SqlDatasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlDatasource")
            .field("pool_size", &self.pool.size())
            .field("dialect", &self.dialect)
            .finish()
    }
}
