use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags};

use crate::errors::{MapperError, MapperResult};

const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed-size pool of SQL connections.
///
/// Cloning is cheap; clones share the same connections. [`SqlConnectionPool::get`]
/// blocks until a connection is free and the returned guard hands it back on drop.
#[derive(Clone)]
pub struct SqlConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
    size: usize,
    checkout_timeout: Duration,
}

impl SqlConnectionPool {
    /// Open `size` connections to the database file at `path`.
    pub fn open(path: &Path, size: usize) -> MapperResult<Self> {
        let connections = (0..size.max(1))
            .map(|_| {
                let conn = Connection::open(path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                Ok(conn)
            })
            .collect::<MapperResult<Vec<_>>>()?;
        Ok(Self::from_connections(connections))
    }

    /// Open `size` connections to a named in-memory database shared by the pool.
    pub fn open_shared_memory(name: &str, size: usize) -> MapperResult<Self> {
        let uri = format!("file:{}?mode=memory&cache=shared", name);
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;
        let connections = (0..size.max(1))
            .map(|_| {
                let conn = Connection::open_with_flags(&uri, flags)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                Ok(conn)
            })
            .collect::<MapperResult<Vec<_>>>()?;
        Ok(Self::from_connections(connections))
    }

    /// Wrap connections the caller has already opened and configured.
    pub fn from_connections(connections: Vec<Connection>) -> Self {
        let size = connections.len();
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(connections),
                available: Condvar::new(),
                size,
                checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Connections not currently checked out.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Check out a connection, waiting for one to be returned if necessary.
    pub fn get(&self) -> MapperResult<PooledConnection<'_>> {
        let mut idle = self.inner.idle.lock();
        loop {
            if let Some(conn) = idle.pop() {
                return Ok(PooledConnection {
                    pool: &self.inner,
                    conn: ManuallyDrop::new(conn),
                });
            }
            if self.inner.size == 0 {
                return Err(MapperError::Io("connection pool is empty".into()));
            }
            let waited = self
                .inner
                .available
                .wait_for(&mut idle, self.inner.checkout_timeout);
            if waited.timed_out() && idle.is_empty() {
                return Err(MapperError::Io(format!(
                    "timed out after {:?} waiting for a pooled connection",
                    self.inner.checkout_timeout
                )));
            }
        }
    }
}

/// A checked-out connection; returned to the pool on drop.
pub struct PooledConnection<'a> {
    pool: &'a PoolInner,
    conn: ManuallyDrop<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        // SAFETY: `conn` is never touched again after this point and the
        // guard is not dropped twice, so the connection moves out exactly once.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.idle.lock().push(conn);
        self.pool.available.notify_one();
    }
}
