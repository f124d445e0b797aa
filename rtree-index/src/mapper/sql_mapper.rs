use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::{params, OptionalExtension};

use super::sql_dialect::{SqlDialect, SqlDialectKind};
use super::sql_pool::SqlConnectionPool;
use super::ElementMapper;
use crate::envelope::{Bounds, NamedEnvelope, ReferenceSystem};
use crate::errors::{MapperError, MapperResult};

/// Element mapper storing records in one table of a SQL database.
pub struct SqlElementMapper {
    pool: SqlConnectionPool,
    dialect: Box<dyn SqlDialect>,
    table: String,
    closed: AtomicBool,
}

impl SqlElementMapper {
    /// Bind to `table`, creating it if it does not exist.
    pub fn open(pool: SqlConnectionPool, kind: SqlDialectKind, table: &str) -> MapperResult<Self> {
        let dialect = kind.dialect();
        pool.get()?.execute_batch(&dialect.create_table(table))?;
        log::debug!("Opened {} element table {}", dialect.name(), table);
        Ok(Self {
            pool,
            dialect,
            table: table.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    /// Drop `table` and everything in it.
    pub fn drop_table(pool: &SqlConnectionPool, kind: SqlDialectKind, table: &str) -> MapperResult<()> {
        pool.get()?.execute_batch(&kind.dialect().drop_table(table))?;
        log::debug!("Dropped element table {}", table);
        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn check_opened(&self) -> MapperResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MapperError::Closed);
        }
        Ok(())
    }
}

fn encode_corner(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_corner(identifier: &str, bytes: &[u8]) -> MapperResult<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return Err(MapperError::Corrupt(format!(
            "record {}: corner of {} bytes is not a whole number of f64s",
            identifier,
            bytes.len()
        )));
    }
    let mut values = Vec::with_capacity(bytes.len() / 8);
    for chunk in bytes.chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        values.push(f64::from_le_bytes(raw));
    }
    Ok(values)
}

impl ElementMapper for SqlElementMapper {
    fn put(&self, envelope: &NamedEnvelope) -> MapperResult<()> {
        self.check_opened()?;
        let lower = encode_corner(envelope.bounds().lower());
        let upper = encode_corner(envelope.bounds().upper());
        let crs = envelope.reference_system().code();
        let duplicates = envelope.duplicate_count() as i64;

        let mut conn = self.pool.get()?;
        match self.dialect.upsert(&self.table) {
            Some(sql) => {
                conn.execute(&sql, params![envelope.identifier(), lower, upper, crs, duplicates])?;
            }
            None => {
                let tx = conn.transaction()?;
                tx.execute(&self.dialect.delete(&self.table), params![envelope.identifier()])?;
                tx.execute(
                    &self.dialect.insert(&self.table),
                    params![envelope.identifier(), lower, upper, crs, duplicates],
                )?;
                tx.commit()?;
            }
        }
        Ok(())
    }

    fn get(&self, identifier: &str) -> MapperResult<Option<NamedEnvelope>> {
        self.check_opened()?;
        let conn = self.pool.get()?;
        let row = conn
            .query_row(&self.dialect.select(&self.table), params![identifier], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .optional()?;

        let Some((id, lower, upper, crs, duplicates)) = row else {
            return Ok(None);
        };
        let bounds = Bounds::new(decode_corner(&id, &lower)?, decode_corner(&id, &upper)?)
            .map_err(|e| MapperError::Corrupt(format!("record {}: {}", id, e)))?;
        let duplicates = u32::try_from(duplicates)
            .map_err(|_| MapperError::Corrupt(format!("record {}: bad duplicate count", id)))?;
        Ok(Some(
            NamedEnvelope::new(id, bounds, ReferenceSystem::new(crs)).with_duplicate_count(duplicates),
        ))
    }

    fn remove(&self, identifier: &str) -> MapperResult<bool> {
        self.check_opened()?;
        let removed = self
            .pool
            .get()?
            .execute(&self.dialect.delete(&self.table), params![identifier])?;
        Ok(removed > 0)
    }

    fn clear(&self) -> MapperResult<()> {
        self.check_opened()?;
        self.pool.get()?.execute(&self.dialect.clear(&self.table), [])?;
        Ok(())
    }

    fn len(&self) -> MapperResult<u64> {
        self.check_opened()?;
        let count: i64 = self
            .pool
            .get()?
            .query_row(&self.dialect.count(&self.table), [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn flush(&self) -> MapperResult<()> {
        // Statements run in autocommit mode; nothing is buffered here.
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
