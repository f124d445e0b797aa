//! SQL dialects for the element table.
//!
//! Every dialect manages the same logical table:
//!
//! | column            | contents                                  |
//! |-------------------|-------------------------------------------|
//! | `identifier`      | primary key                               |
//! | `lower`, `upper`  | corner coordinates, little-endian f64s    |
//! | `crs_ref`         | reference system code                     |
//! | `duplicate_count` | number of collapsed source features       |
//!
//! Statements bind parameters in that column order.

use std::path::Path;

use serde::{Deserialize, Serialize};

const TABLE_PREFIX: &str = "rtree_elements_";
const MAX_TABLE_NAME_LEN: usize = 63;

/// Produces the statements an element mapper runs against one table.
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_table(&self, table: &str) -> String;

    /// Single-statement upsert, if the dialect has one. Without it the mapper
    /// deletes and inserts inside a transaction.
    fn upsert(&self, table: &str) -> Option<String>;

    fn insert(&self, table: &str) -> String;

    fn select(&self, table: &str) -> String;

    fn delete(&self, table: &str) -> String;

    fn clear(&self, table: &str) -> String {
        format!("DELETE FROM {}", table)
    }

    fn count(&self, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", table)
    }

    fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", table)
    }
}

/// Portable SQL with `?` placeholders; replaces rows by delete + insert.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleDialect;

impl SqlDialect for SimpleDialect {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             identifier VARCHAR(255) NOT NULL PRIMARY KEY, \
             lower BLOB NOT NULL, \
             upper BLOB NOT NULL, \
             crs_ref VARCHAR(255) NOT NULL, \
             duplicate_count INTEGER NOT NULL)",
            table
        )
    }

    fn upsert(&self, _table: &str) -> Option<String> {
        None
    }

    fn insert(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (identifier, lower, upper, crs_ref, duplicate_count) \
             VALUES (?, ?, ?, ?, ?)",
            table
        )
    }

    fn select(&self, table: &str) -> String {
        format!(
            "SELECT identifier, lower, upper, crs_ref, duplicate_count FROM {} WHERE identifier = ?",
            table
        )
    }

    fn delete(&self, table: &str) -> String {
        format!("DELETE FROM {} WHERE identifier = ?", table)
    }
}

/// PostgreSQL flavour: `BYTEA` columns, `$n` placeholders, `ON CONFLICT` upsert.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             identifier TEXT PRIMARY KEY, \
             lower BYTEA NOT NULL, \
             upper BYTEA NOT NULL, \
             crs_ref TEXT NOT NULL, \
             duplicate_count INTEGER NOT NULL)",
            table
        )
    }

    fn upsert(&self, table: &str) -> Option<String> {
        Some(format!(
            "INSERT INTO {} (identifier, lower, upper, crs_ref, duplicate_count) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (identifier) DO UPDATE SET \
             lower = EXCLUDED.lower, \
             upper = EXCLUDED.upper, \
             crs_ref = EXCLUDED.crs_ref, \
             duplicate_count = EXCLUDED.duplicate_count",
            table
        ))
    }

    fn insert(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (identifier, lower, upper, crs_ref, duplicate_count) \
             VALUES ($1, $2, $3, $4, $5)",
            table
        )
    }

    fn select(&self, table: &str) -> String {
        format!(
            "SELECT identifier, lower, upper, crs_ref, duplicate_count FROM {} WHERE identifier = $1",
            table
        )
    }

    fn delete(&self, table: &str) -> String {
        format!("DELETE FROM {} WHERE identifier = $1", table)
    }
}

/// Embedded-database flavour: `BLOB` columns, numbered `?n` placeholders,
/// `INSERT OR REPLACE` upsert.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedDialect;

impl SqlDialect for EmbeddedDialect {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             identifier TEXT PRIMARY KEY NOT NULL, \
             lower BLOB NOT NULL, \
             upper BLOB NOT NULL, \
             crs_ref TEXT NOT NULL, \
             duplicate_count INTEGER NOT NULL) WITHOUT ROWID",
            table
        )
    }

    fn upsert(&self, table: &str) -> Option<String> {
        Some(format!(
            "INSERT OR REPLACE INTO {} (identifier, lower, upper, crs_ref, duplicate_count) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            table
        ))
    }

    fn insert(&self, table: &str) -> String {
        format!(
            "INSERT INTO {} (identifier, lower, upper, crs_ref, duplicate_count) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            table
        )
    }

    fn select(&self, table: &str) -> String {
        format!(
            "SELECT identifier, lower, upper, crs_ref, duplicate_count FROM {} WHERE identifier = ?1",
            table
        )
    }

    fn delete(&self, table: &str) -> String {
        format!("DELETE FROM {} WHERE identifier = ?1", table)
    }
}

/// Selects one of the built-in dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SqlDialectKind {
    #[default]
    Simple,
    Postgres,
    Embedded,
}

impl SqlDialectKind {
    pub fn dialect(&self) -> Box<dyn SqlDialect> {
        match self {
            SqlDialectKind::Simple => Box::new(SimpleDialect),
            SqlDialectKind::Postgres => Box::new(PostgresDialect),
            SqlDialectKind::Embedded => Box::new(EmbeddedDialect),
        }
    }
}

/// Table name for the tree stored at `location`.
///
/// The path is folded to lowercase alphanumerics and underscores; a hash of the
/// full path keeps distinct locations apart after truncation.
pub fn table_name_for(location: &Path) -> String {
    let raw = location.to_string_lossy();
    let hash = fnv1a(raw.as_bytes());

    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let suffix = format!("_{:016x}", hash);
    let budget = MAX_TABLE_NAME_LEN - TABLE_PREFIX.len() - suffix.len();
    let tail_start = sanitized.len().saturating_sub(budget);

    format!("{}{}{}", TABLE_PREFIX, &sanitized[tail_start..], suffix)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
