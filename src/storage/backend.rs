//! Physical table capability shared by every sharded store, plus the in-memory
//! implementation used by tests and single-process deployments.

use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// One mutation inside an atomic [`TableBackend::write_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        table: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: String,
        key: Vec<u8>,
    },
}

impl WriteOp {
    pub fn put(
        table: impl Into<String>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        WriteOp::Put {
            table: table.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(table: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        WriteOp::Delete {
            table: table.into(),
            key: key.into(),
        }
    }
}

/// Named, byte-ordered physical tables.
///
/// Methods block; async callers run them on the blocking pool.
pub trait TableBackend: Send + Sync + 'static {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn contains(&self, table: &str, key: &[u8]) -> Result<bool> {
        Ok(self.get(table, key)?.is_some())
    }

    /// One result per key, in key order.
    fn multi_get(&self, table: &str, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Inserts only when `key` is absent. Returns `false` if it was already present.
    fn insert_unique(&self, table: &str, key: &[u8], value: &[u8]) -> Result<bool>;

    /// Applies every op or none of them.
    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()>;

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_batch(vec![WriteOp::put(table, key, value)])
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<()> {
        self.write_batch(vec![WriteOp::delete(table, key)])
    }

    /// Entries with `lower <= key < upper`, largest key first, at most `limit`.
    fn scan_rev(
        &self,
        table: &str,
        lower: &[u8],
        upper: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-process backend. Tables must be declared up front so misrouted keys fail loudly.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryBackend {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: RwLock::new(
                tables
                    .into_iter()
                    .map(|name| (name.into(), Table::new()))
                    .collect(),
            ),
        }
    }

    /// Row count of one physical table; `None` if the table is unknown.
    pub fn len(&self, table: &str) -> Option<usize> {
        self.tables.read().get(table).map(|rows| rows.len())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

fn unknown(table: &str) -> anyhow::Error {
    anyhow!("unknown table {table}")
}

impl TableBackend for MemoryBackend {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read();
        let rows = tables.get(table).ok_or_else(|| unknown(table))?;
        Ok(rows.get(key).cloned())
    }

    fn multi_get(&self, table: &str, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let tables = self.tables.read();
        let rows = tables.get(table).ok_or_else(|| unknown(table))?;
        Ok(keys.iter().map(|key| rows.get(key).cloned()).collect())
    }

    fn insert_unique(&self, table: &str, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| unknown(table))?;
        if rows.contains_key(key) {
            return Ok(false);
        }
        rows.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut tables = self.tables.write();
        // Validate first so a bad op leaves nothing half-applied.
        for op in &ops {
            let table = match op {
                WriteOp::Put { table, .. } | WriteOp::Delete { table, .. } => table,
            };
            if !tables.contains_key(table.as_str()) {
                return Err(unknown(table));
            }
        }
        for op in ops {
            match op {
                WriteOp::Put { table, key, value } => {
                    if let Some(rows) = tables.get_mut(table.as_str()) {
                        rows.insert(key, value);
                    }
                }
                WriteOp::Delete { table, key } => {
                    if let Some(rows) = tables.get_mut(table.as_str()) {
                        rows.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn scan_rev(
        &self,
        table: &str,
        lower: &[u8],
        upper: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read();
        let rows = tables.get(table).ok_or_else(|| unknown(table))?;
        if lower >= upper {
            return Ok(Vec::new());
        }
        Ok(rows
            .range(lower.to_vec()..upper.to_vec())
            .rev()
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
